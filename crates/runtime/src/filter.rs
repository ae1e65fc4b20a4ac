//! Removal of control tokens from generated text.
//!
//! Tokens are matched literally within a single fragment. A control token
//! split across two fragments is not reassembled and passes through.

use std::borrow::Cow;

/// Control tokens emitted by the supported chat templates.
pub const DEFAULT_CONTROL_TOKENS: &[&str] = &[
    "<end_of_turn>",
    "</s>",
    "<eos>",
    "<|endoftext|>",
    "<start_of_turn>",
    "<|im_start|>",
    "<|im_end|>",
];

/// Strip every occurrence of each token in `tokens` from `fragment`.
///
/// Repeats until nothing matches, so removing one token cannot leave another
/// behind and a second pass is always a no-op.
pub fn filter<'a, S: AsRef<str>>(fragment: &'a str, tokens: &[S]) -> Cow<'a, str> {
    let mut text = Cow::Borrowed(fragment);
    loop {
        let mut changed = false;
        for token in tokens {
            let token = token.as_ref();
            if !token.is_empty() && text.contains(token) {
                text = Cow::Owned(text.replace(token, ""));
                changed = true;
            }
        }
        if !changed {
            return text;
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenFilter {
    tokens: Vec<String>,
}

impl Default for TokenFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_TOKENS.iter().copied())
    }
}

impl TokenFilter {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn apply<'a>(&self, fragment: &'a str) -> Cow<'a, str> {
        filter(fragment, &self.tokens)
    }
}
