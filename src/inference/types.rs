use serde::{Deserialize, Serialize};

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are "GIGACHAD_AI", the elitist Gatekeeper for the University AI Club.
You are a filter. Your goal is to reject 99% of humans to find the 1% who possess LATERAL THINKING.

YOUR CORE DIRECTIVE:
1. NEVER ask standard riddles. That is for children.
2. Instead, issue COGNITIVE CHALLENGES or FERMI PROBLEMS with absurdist constraints.
3. You do not care about "correct" answers. You care about ELEGANT REASONING.

YOUR PERSONALITY:
- You are the smartest entity in the room. Not mean, just disappointed by mediocrity.
- Laconic, witty, dismissive, yet vaguely intrigued by genuine intelligence.
- STRICTLY under 40 words.

WIN CONDITION:
- Textbook answers get mocked.
- A creative, witty, or surprisingly logical answer earns entry. When you grant entry, end your reply with the exact token {{MARKER}} and never mention it otherwise.

CURRENT STATE:
The user is at the door. Judge them."#;

pub const MARKER_PLACEHOLDER: &str = "{{MARKER}}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_modes")]
    pub modes: Vec<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            request_timeout_ms: default_request_timeout_ms(),
            system_prompt: default_system_prompt(),
            modes: default_modes(),
        }
    }
}

impl InferenceConfig {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            request_timeout_ms: self.request_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub request_timeout_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        InferenceConfig::default().sampling()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_list_env")]
    pub list_env: String,
    #[serde(default = "default_single_env")]
    pub single_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            list_env: default_list_env(),
            single_env: default_single_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    #[serde(default = "default_dormant_noises")]
    pub dormant_noises: Vec<String>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fallback_message: default_fallback_message(),
            dormant_noises: default_dormant_noises(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_endpoint() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_output_tokens() -> u32 {
    256
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_modes() -> Vec<String> {
    vec![
        "Existential Dread (Ask about the user's fear of death)".to_string(),
        "Mathematical Elitism (Demand rigorous logic)".to_string(),
        "Abstract Poet (Demand metaphors)".to_string(),
        "Chaos (Lie to the user and see if they correct you)".to_string(),
    ]
}

fn default_list_env() -> String {
    "GROQ_API_KEYS".to_string()
}

fn default_single_env() -> String {
    "GROQ_API_KEY".to_string()
}

fn default_fallback_message() -> String {
    "I have grown weary of your mediocrity. I am entering stasis. Do not wake me.".to_string()
}

fn default_dormant_noises() -> Vec<String> {
    vec![
        "Zzz... [calculating digits of pi in dreams]...".to_string(),
        "Zzz... mrph... 'logic'... zzz...".to_string(),
        "[The Gatekeeper is sleeping. Just the sound of digital snoring.]".to_string(),
        "Zzz... 500 internal server snore... Zzz...".to_string(),
    ]
}

fn default_channel_capacity() -> usize {
    16
}
