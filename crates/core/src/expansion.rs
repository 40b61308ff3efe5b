use crate::llm::{strip_code_fence, with_timeout, GenerativeModel};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct QueryExpander {
    model: Arc<dyn GenerativeModel>,
    timeout: Duration,
    temperature: f32,
}

impl QueryExpander {
    pub fn new(model: Arc<dyn GenerativeModel>, timeout: Duration, temperature: f32) -> Self {
        Self {
            model,
            timeout,
            temperature,
        }
    }

    pub async fn expand(&self, query: &str, n: usize) -> Vec<String> {
        if n == 0 || query.trim().is_empty() {
            return vec![query.to_string()];
        }

        let prompt = expansion_prompt(query, n);
        let call = self.model.generate(&prompt, self.temperature);
        match with_timeout("query expansion", self.timeout, call).await {
            Ok(raw) => {
                let expanded = parse_expansions(&raw, query, n);
                debug!(query, variants = expanded.len() - 1, "expanded query");
                expanded
            }
            Err(error) => {
                warn!(query, %error, "query expansion failed; using original query only");
                vec![query.to_string()]
            }
        }
    }
}

fn expansion_prompt(query: &str, n: usize) -> String {
    format!(
        "Rewrite the search query below in {n} different ways that keep its meaning \
         but vary the wording, so that more relevant documents can be found.\n\
         Output one rewrite per line, without numbering or explanations.\n\n\
         Query: {query}"
    )
}

fn parse_expansions(raw: &str, original: &str, n: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    seen.insert(original.trim().to_lowercase());

    let mut expanded = vec![original.to_string()];
    for line in strip_code_fence(raw).lines() {
        if expanded.len() > n {
            break;
        }
        let candidate = strip_list_marker(line);
        // Preambles such as "Here are three rewrites:" introduce the list.
        if candidate.is_empty() || candidate.ends_with(|c: char| c == ':' || c == '：') {
            continue;
        }
        if seen.insert(candidate.to_lowercase()) {
            expanded.push(candidate.to_string());
        }
    }

    expanded
}

fn strip_list_marker(line: &str) -> &str {
    let mut text = line.trim();

    let digits = text.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &text[digits..];
        if let Some(stripped) = rest
            .strip_prefix('.')
            .or_else(|| rest.strip_prefix(')'))
            .or_else(|| rest.strip_prefix('、'))
            .or_else(|| rest.strip_prefix(':'))
        {
            text = stripped.trim_start();
        }
    }

    text = text
        .trim_start_matches(|c: char| matches!(c, '-' | '*' | '•' | '·'))
        .trim();

    text.trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '「' | '」'))
        .trim()
}
