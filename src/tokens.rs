//! Token counting per model family
//!
//! Prompt/completion accounting for LLM calls. Model names arrive in many
//! provider-prefixed spellings (`openrouter/meta-llama/llama-3:free`), so
//! they are normalized onto a small set of canonical encodings before the
//! (expensive) encoder is built and cached.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tiktoken_rs::{cl100k_base, get_bpe_from_model, CoreBPE};

use crate::domain::TokenUsage;

/// Chat-format overhead per message (role/content framing)
const PER_MESSAGE_OVERHEAD: usize = 3;
/// Chat-format overhead per role name
const PER_ROLE: usize = 1;
/// Reply priming tokens appended by the chat format
const REPLY_PRIMING: usize = 3;
/// Rough characters-per-token estimate when no encoder is available
const CHARS_PER_TOKEN_ESTIMATE: usize = 4;

/// Families mapped onto encodings we actually ship. Open-weight families
/// tokenize closely enough to gpt-4 for accounting purposes.
const FAMILY_MAP: &[(&str, &str)] = &[
    ("gpt-4", "gpt-4"),
    ("gpt-3.5", "gpt-3.5-turbo"),
    ("llama", "gpt-4"),
    ("mistral", "gpt-4"),
    ("gemma", "gpt-4"),
    ("qwen", "gpt-4"),
    ("deepseek", "gpt-4"),
    ("claude", "gpt-4"),
];

/// Process-wide counter for callers that don't carry their own
pub static DEFAULT_TOKEN_COUNTER: Lazy<TokenCounter> = Lazy::new(TokenCounter::new);

/// Thread-safe cache of model-family encoders
pub struct TokenCounter {
    encoders: RwLock<HashMap<String, Arc<CoreBPE>>>,
}

impl TokenCounter {
    /// Empty counter; encoders are built lazily per model family
    pub fn new() -> Self {
        Self {
            encoders: RwLock::new(HashMap::new()),
        }
    }

    /// Count tokens in `text` for `model`. Empty text is always 0.
    pub fn count_tokens(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder_for(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => estimate_tokens(text),
        }
    }

    /// Token count of a two-message chat prompt (system + user) in the
    /// chat wire format: per-message overhead, role names, and reply
    /// priming are all accounted, so even an empty prompt is non-zero.
    pub fn count_chat_tokens(&self, system_prompt: &str, user_prompt: &str, model: &str) -> usize {
        PER_MESSAGE_OVERHEAD
            + self.count_tokens("system", model)
            + self.count_tokens(system_prompt, model)
            + PER_ROLE
            + PER_MESSAGE_OVERHEAD
            + self.count_tokens("user", model)
            + self.count_tokens(user_prompt, model)
            + PER_ROLE
            + REPLY_PRIMING
    }

    /// Token count of a completion
    pub fn count_completion_tokens(&self, text: &str, model: &str) -> usize {
        self.count_tokens(text, model)
    }

    /// Full usage accounting for one chat call
    pub fn calculate_usage(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        completion: &str,
        model: &str,
        provider: &str,
    ) -> TokenUsage {
        let prompt_tokens = self.count_chat_tokens(system_prompt, user_prompt, model);
        let completion_tokens = self.count_completion_tokens(completion, model);
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            model: model.to_string(),
            provider: provider.to_string(),
        }
    }

    fn encoder_for(&self, model: &str) -> Option<Arc<CoreBPE>> {
        let canonical = normalize_model(model);
        if let Some(bpe) = self.encoders.read().get(&canonical) {
            return Some(bpe.clone());
        }
        let bpe = match get_bpe_from_model(&canonical).or_else(|_| cl100k_base()) {
            Ok(bpe) => Arc::new(bpe),
            Err(_) => return None,
        };
        self.encoders
            .write()
            .entry(canonical)
            .or_insert_with(|| bpe.clone());
        Some(bpe)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce a provider-qualified model name to a canonical encoding name
fn normalize_model(model: &str) -> String {
    let mut name = model.trim().to_lowercase();
    if let Some(idx) = name.rfind('/') {
        name = name[idx + 1..].to_string();
    }
    if let Some(stripped) = name.strip_suffix(":free") {
        name = stripped.to_string();
    }
    for (family, canonical) in FAMILY_MAP {
        if name.contains(family) {
            return (*canonical).to_string();
        }
    }
    "gpt-4".to_string()
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN_ESTIMATE)
}
