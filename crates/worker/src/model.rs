//! Language model interface and the built-in tiny model.
//!
//! The inference engine proper is an external collaborator; the dispatch
//! fabric only needs `init`, `next_token` and `decode` plus an EOS
//! sentinel. The shipped [`TinyModel`] is a deterministic stand-in: a
//! hash-chain generator over a fixed vocabulary, so the same prompt always
//! produces the same token stream.

/// Autoregressive model as seen by the worker loop.
pub trait LanguageModel {
    /// Reset internal state and condition on `prompt`.
    fn init(&mut self, prompt: &str);

    /// Produce the next token id given the previously emitted one
    /// (`None` on the first step after `init`).
    fn next_token(&mut self, prev: Option<u32>) -> u32;

    /// Decode a single token id into text.
    fn decode(&self, token: u32) -> String;

    /// The end-of-sequence sentinel id.
    fn eos_token(&self) -> u32;
}

const VOCAB: &[&str] = &[
    "the", "a", "and", "of", "to", "in", "it", "was", "is", "for", "on", "with", "as", "at",
    "by", "this", "that", "from", "they", "we", "she", "he", "little", "big", "old", "new",
    "good", "day", "night", "morning", "forest", "river", "house", "garden", "bird", "cat",
    "dog", "fox", "rabbit", "story", "walked", "jumped", "looked", "found", "said", "smiled",
    "ran", "slept", "played", "sang", "then", "once", "again", "happily", "quietly", "slowly",
    "suddenly", "together", "home", "away", "friend", "sun", "moon", "tree",
];

/// Multiplier of the splitmix-style state update.
const STATE_MULT: u64 = 0x5851_F42D_4C95_7F2D;

/// Steps before EOS becomes possible, so no stream is empty.
const MIN_TOKENS_BEFORE_EOS: u64 = 4;

/// Deterministic toy model.
///
/// The generator state is seeded from an FNV-1a hash of the prompt and
/// advanced by one multiply-add per token, folding in the previous token
/// id. EOS fires when a narrow slice of the state lands on zero, which
/// gives occasional short sequences without making them common.
pub struct TinyModel {
    state: u64,
    steps: u64,
}

impl TinyModel {
    pub fn new() -> Self {
        Self { state: 0, steps: 0 }
    }
}

impl Default for TinyModel {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageModel for TinyModel {
    fn init(&mut self, prompt: &str) {
        let mut hash: u64 = 0xCBF2_9CE4_8422_2325;
        for byte in prompt.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        self.state = hash;
        self.steps = 0;
    }

    fn next_token(&mut self, prev: Option<u32>) -> u32 {
        let folded = match prev {
            Some(token) => u64::from(token) + 1,
            None => 0,
        };
        self.state = self
            .state
            .wrapping_mul(STATE_MULT)
            .wrapping_add(folded * 2 + 1);
        self.steps += 1;

        if self.steps > MIN_TOKENS_BEFORE_EOS && (self.state >> 24) % 61 == 0 {
            return self.eos_token();
        }
        ((self.state >> 33) % VOCAB.len() as u64) as u32
    }

    fn decode(&self, token: u32) -> String {
        match VOCAB.get(token as usize) {
            Some(word) => format!("{} ", word),
            None => String::new(),
        }
    }

    fn eos_token(&self) -> u32 {
        VOCAB.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(model: &mut TinyModel, prompt: &str, count: usize) -> Vec<u32> {
        model.init(prompt);
        let mut tokens = Vec::new();
        let mut prev = None;
        for _ in 0..count {
            let token = model.next_token(prev);
            if token == model.eos_token() {
                break;
            }
            tokens.push(token);
            prev = Some(token);
        }
        tokens
    }

    #[test]
    fn test_same_prompt_same_stream() {
        let mut model = TinyModel::new();
        let first = generate(&mut model, "once upon a time", 20);
        let second = generate(&mut model, "once upon a time", 20);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn test_different_prompts_diverge() {
        let mut model = TinyModel::new();
        let a = generate(&mut model, "the fox", 20);
        let b = generate(&mut model, "the cat", 20);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_known_and_unknown_tokens() {
        let model = TinyModel::new();
        assert_eq!(model.decode(0), "the ");
        assert_eq!(model.decode(model.eos_token()), "");
    }
}
