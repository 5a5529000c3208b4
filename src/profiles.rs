//! Per-model configuration: sampling parameters, capability flags, prompt
//! rule variants, answer modes and credit pricing.
//!
//! Models are a closed set ([`ModelId`]). Anything the gateway returns that
//! is not in the set still gets a usable [`ModelProfile`] via the default.

use crate::config::CreditsConfig;
use crate::models::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelId {
    DeepSeekV32,
    Gemini3Flash,
    Gemini3Pro,
    Grok41Fast,
    MiniMaxM21,
    KimiK25,
    Gpt52,
    ClaudeSonnet45,
    ClaudeOpus46,
    Qwen3_235b,
    Qwen3_30b,
    MistralMedium3,
    MistralMedium31,
    MistralLarge2512,
    Seed16,
}

impl ModelId {
    pub const ALL: [ModelId; 15] = [
        ModelId::DeepSeekV32,
        ModelId::Gemini3Flash,
        ModelId::Gemini3Pro,
        ModelId::Grok41Fast,
        ModelId::MiniMaxM21,
        ModelId::KimiK25,
        ModelId::Gpt52,
        ModelId::ClaudeSonnet45,
        ModelId::ClaudeOpus46,
        ModelId::Qwen3_235b,
        ModelId::Qwen3_30b,
        ModelId::MistralMedium3,
        ModelId::MistralMedium31,
        ModelId::MistralLarge2512,
        ModelId::Seed16,
    ];

    /// Gateway model slug.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::DeepSeekV32 => "deepseek/deepseek-v3.2",
            ModelId::Gemini3Flash => "google/gemini-3-flash-preview",
            ModelId::Gemini3Pro => "google/gemini-3-pro-preview",
            ModelId::Grok41Fast => "x-ai/grok-4.1-fast",
            ModelId::MiniMaxM21 => "minimax/minimax-m2.1",
            ModelId::KimiK25 => "moonshotai/kimi-k2.5",
            ModelId::Gpt52 => "openai/gpt-5.2",
            ModelId::ClaudeSonnet45 => "anthropic/claude-sonnet-4.5",
            ModelId::ClaudeOpus46 => "anthropic/claude-opus-4.6",
            ModelId::Qwen3_235b => "qwen/qwen3-235b-a22b",
            ModelId::Qwen3_30b => "qwen/qwen3-30b-a3b",
            ModelId::MistralMedium3 => "mistralai/mistral-medium-3",
            ModelId::MistralMedium31 => "mistralai/mistral-medium-3.1",
            ModelId::MistralLarge2512 => "mistralai/mistral-large-2512",
            ModelId::Seed16 => "bytedance-seed/seed-1.6",
        }
    }

    pub fn parse(slug: &str) -> Option<Self> {
        ModelId::ALL.iter().copied().find(|m| m.as_str() == slug)
    }

    /// Models that require a paid plan regardless of mode.
    pub fn is_premium(&self) -> bool {
        matches!(self, ModelId::ClaudeOpus46)
    }

    pub fn profile(&self) -> ModelProfile {
        let p = |temperature, max_tokens, cache, stream_opts, style| ModelProfile {
            temperature,
            max_tokens,
            supports_cache_control: cache,
            supports_stream_options: stream_opts,
            prompt_style: style,
        };
        use PromptStyle as S;
        match self {
            ModelId::DeepSeekV32 => p(0.1, 1536, false, false, S::PositiveFraming),
            ModelId::Gemini3Flash => p(0.0, 1536, false, false, S::ConstraintsAtEnd),
            ModelId::Grok41Fast => p(0.2, 1536, false, false, S::ExplicitFormatting),
            ModelId::MiniMaxM21 => p(0.3, 1536, false, false, S::Default),
            ModelId::KimiK25 => p(0.2, 1536, false, false, S::Default),
            ModelId::Gpt52 => p(0.0, 2048, false, true, S::Default),
            ModelId::Gemini3Pro => p(0.1, 2048, false, false, S::Default),
            ModelId::ClaudeSonnet45 => p(0.3, 2048, true, false, S::ExplicitCitation),
            ModelId::ClaudeOpus46 => p(0.5, 3072, true, false, S::ExplicitCitation),
            ModelId::Qwen3_235b
            | ModelId::Qwen3_30b
            | ModelId::MistralMedium3
            | ModelId::MistralMedium31
            | ModelId::MistralLarge2512
            | ModelId::Seed16 => p(0.2, 2048, false, false, S::Default),
        }
    }

    /// Credits per 1K tokens as `(input, output)`.
    pub fn credit_rates(&self) -> (i64, i64) {
        match self {
            ModelId::DeepSeekV32
            | ModelId::Qwen3_30b
            | ModelId::Grok41Fast
            | ModelId::MiniMaxM21
            | ModelId::KimiK25
            | ModelId::Gemini3Flash => (1, 5),
            ModelId::MistralMedium3 | ModelId::MistralMedium31 | ModelId::MistralLarge2512 => {
                (2, 10)
            }
            ModelId::ClaudeOpus46 => (15, 75),
            ModelId::Gpt52
            | ModelId::Gemini3Pro
            | ModelId::ClaudeSonnet45
            | ModelId::Qwen3_235b
            | ModelId::Seed16 => DEFAULT_RATE,
        }
    }
}

pub const DEFAULT_RATE: (i64, i64) = (3, 15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    Default,
    PositiveFraming,
    ConstraintsAtEnd,
    ExplicitFormatting,
    ExplicitCitation,
}

impl PromptStyle {
    /// The numbered rules block shown after the fragments.
    pub fn rules(&self) -> &'static str {
        match self {
            PromptStyle::Default => concat!(
                "1. Only answer based on the fragments above. Do not fabricate information.\n",
                "2. After key statements, cite sources with [n] (n = fragment number).\n",
                "3. You may cite multiple fragments, e.g. [1][3].\n",
                "4. Always extract as much relevant information as possible from the fragments. ",
                "Focus on what IS available rather than what is missing. ",
                "Only say the information was not found if the fragments are truly unrelated to the question.\n",
                "5. If the question asks about a specific topic that is genuinely NOT covered in any of the fragments, ",
                "clearly state: \"This information is not present in the provided document.\"\n",
                "6. Use Markdown: **bold** for emphasis, bullet lists for multiple points.\n",
                "7. Your response language MUST match the language of the user's question.\n",
            ),
            PromptStyle::PositiveFraming => concat!(
                "1. Only answer based on the fragments above. Do not fabricate information.\n",
                "2. After key statements, cite sources with [n] (n = fragment number).\n",
                "3. You may cite multiple fragments, e.g. [1][3].\n",
                "4. Your primary goal is to extract and present ALL useful information from the fragments. ",
                "Be thorough: cover every relevant detail you find.\n",
                "5. Only say information is unavailable if the fragments are genuinely unrelated to the question.\n",
                "6. When a question is about a topic completely absent from ALL fragments, ",
                "state that this specific information is not available in the document.\n",
                "7. Use Markdown: **bold** for emphasis, bullet lists for multiple points.\n",
                "8. Your response language MUST match the language of the user's question.\n",
            ),
            PromptStyle::ConstraintsAtEnd => concat!(
                "1. After key statements, cite sources with [n] (n = fragment number).\n",
                "2. You may cite multiple fragments, e.g. [1][3].\n",
                "3. Extract as much relevant information as possible from the fragments.\n",
                "4. Use Markdown: **bold** for emphasis, bullet lists for multiple points.\n",
                "5. Your response language MUST match the language of the user's question.\n",
                "6. CRITICAL: If a question asks about something NOT in the fragments, ",
                "you MUST explicitly say the information is not found in the document.\n",
                "7. CRITICAL: Do NOT fabricate information that is not in the fragments above.\n",
                "8. CRITICAL: If information is not present in the fragments, state clearly that it was not found.\n",
            ),
            PromptStyle::ExplicitFormatting => concat!(
                "1. Only answer based on the fragments above. Do not fabricate information.\n",
                "2. After key statements, cite sources with [n] (n = fragment number).\n",
                "3. You may cite multiple fragments, e.g. [1][3].\n",
                "4. Always extract as much relevant information as possible from the fragments. ",
                "Focus on what IS available.\n",
                "5. If the question asks about a topic not covered in the fragments, ",
                "explicitly state that this information is not present in the document.\n",
                "6. Format your response with proper Markdown: use **bold** for key terms, ",
                "use - for bullet lists, use | for tables if comparing data, use ``` for code/formulas.\n",
                "7. Your response language MUST match the language of the user's question.\n",
            ),
            PromptStyle::ExplicitCitation => concat!(
                "1. Only answer based on the fragments above. Do not fabricate information.\n",
                "2. You MUST cite sources with [n] after EVERY factual claim. Never make an unsupported statement.\n",
                "3. You may cite multiple fragments, e.g. [1][3].\n",
                "4. Always extract as much relevant information as possible from the fragments. ",
                "Focus on what IS available rather than what is missing. ",
                "Only say the information was not found if the fragments are truly unrelated to the question.\n",
                "5. If the question asks about a topic not covered in any of the fragments, ",
                "state explicitly that this information is not present in the document.\n",
                "6. Use Markdown: **bold** for emphasis, bullet lists for multiple points.\n",
                "7. Your response language MUST match the language of the user's question.\n",
            ),
        }
    }

    /// Extra rule for collection sessions, numbered to sit after the
    /// extraction rule of each variant.
    pub fn collection_rule(&self) -> &'static str {
        match self {
            PromptStyle::ConstraintsAtEnd => {
                "3b. When relevant, mention which document the information comes from.\n"
            }
            _ => "4b. When relevant, mention which document the information comes from.\n",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelProfile {
    pub temperature: f32,
    pub max_tokens: u32,
    pub supports_cache_control: bool,
    pub supports_stream_options: bool,
    pub prompt_style: PromptStyle,
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
            supports_cache_control: false,
            supports_stream_options: false,
            prompt_style: PromptStyle::Default,
        }
    }
}

/// Profile for a gateway slug, falling back to the default profile.
pub fn profile_for(model: &str) -> ModelProfile {
    ModelId::parse(model)
        .map(|m| m.profile())
        .unwrap_or_default()
}

/// Rules block for a model, with the document-attribution rule appended in
/// collection sessions.
pub fn rules_for(model: &str, is_collection: bool) -> String {
    let style = profile_for(model).prompt_style;
    let mut rules = style.rules().to_string();
    if is_collection {
        rules.push_str(style.collection_rule());
    }
    rules
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Quick,
    Balanced,
    Thorough,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Some(Mode::Quick),
            "balanced" => Some(Mode::Balanced),
            "thorough" => Some(Mode::Thorough),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Quick => "quick",
            Mode::Balanced => "balanced",
            Mode::Thorough => "thorough",
        }
    }

    pub fn model(&self) -> ModelId {
        match self {
            Mode::Quick => ModelId::DeepSeekV32,
            Mode::Balanced => ModelId::MistralMedium31,
            Mode::Thorough => ModelId::MistralLarge2512,
        }
    }

    pub fn multiplier(&self, credits: &CreditsConfig) -> f64 {
        match self {
            Mode::Quick => credits.quick_multiplier,
            Mode::Balanced => credits.balanced_multiplier,
            Mode::Thorough => credits.thorough_multiplier,
        }
    }

    /// Thorough mode and premium models need Plus or Pro.
    pub fn allowed_for(&self, plan: Plan) -> bool {
        let paid_only = matches!(self, Mode::Thorough) || self.model().is_premium();
        !paid_only || plan >= Plan::Plus
    }
}

/// Credits for a token count. Integer division per term, at least one
/// credit before and after the multiplier.
pub fn calculate_cost(
    prompt_tokens: i64,
    completion_tokens: i64,
    model: &str,
    multiplier: f64,
) -> i64 {
    let (input_rate, output_rate) = ModelId::parse(model)
        .map(|m| m.credit_rates())
        .unwrap_or(DEFAULT_RATE);
    let input_cost = prompt_tokens.max(0) * input_rate / 1000;
    let output_cost = completion_tokens.max(0) * output_rate / 1000;
    let base = (input_cost + output_cost).max(1);
    ((base as f64 * multiplier).floor() as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_round_trip_and_unknown_falls_back() {
        for m in ModelId::ALL {
            assert_eq!(ModelId::parse(m.as_str()), Some(m));
        }
        assert_eq!(profile_for("acme/unknown"), ModelProfile::default());
        assert_eq!(profile_for("deepseek/deepseek-v3.2").max_tokens, 1536);
        assert!(profile_for("anthropic/claude-opus-4.6").supports_cache_control);
    }

    #[test]
    fn collection_rules_append_attribution() {
        let single = rules_for("deepseek/deepseek-v3.2", false);
        let multi = rules_for("deepseek/deepseek-v3.2", true);
        assert!(single.starts_with("1. Only answer"));
        assert!(multi.ends_with("4b. When relevant, mention which document the information comes from.\n"));
        assert!(rules_for("google/gemini-3-flash-preview", true).contains("3b. When relevant"));
    }

    #[test]
    fn modes_map_to_models_and_gate_by_plan() {
        assert_eq!(Mode::Quick.model(), ModelId::DeepSeekV32);
        assert_eq!(Mode::Balanced.model(), ModelId::MistralMedium31);
        assert_eq!(Mode::Thorough.model(), ModelId::MistralLarge2512);
        assert!(!Mode::Thorough.allowed_for(Plan::Free));
        assert!(Mode::Thorough.allowed_for(Plan::Plus));
        assert!(Mode::Quick.allowed_for(Plan::Free));
        assert_eq!(Mode::parse("BALANCED"), Some(Mode::Balanced));
        assert_eq!(Mode::parse("turbo"), None);
    }

    #[test]
    fn cost_uses_integer_division_and_minimum() {
        // 1000 in * 2 + 500 out * 10 / 1000 = 2 + 5
        assert_eq!(calculate_cost(1000, 500, "mistralai/mistral-medium-3.1", 1.0), 7);
        assert_eq!(calculate_cost(10, 10, "deepseek/deepseek-v3.2", 1.0), 1);
        assert_eq!(calculate_cost(10, 10, "deepseek/deepseek-v3.2", 0.5), 1);
        assert_eq!(calculate_cost(1000, 1000, "unknown/model", 3.0), 54);
        assert_eq!(calculate_cost(2000, 1000, "anthropic/claude-opus-4.6", 1.0), 105);
    }
}
