//! Shared constants for the thinkstream application

/// Default model repository resolved by the backend loader
pub const DEFAULT_MODEL_ID: &str = "onnx-community/DeepSeek-R1-Distill-Qwen-1.5B-ONNX";

/// Default upper bound on generated tokens per run
pub const DEFAULT_MAX_NEW_TOKENS: usize = 2048;

/// Markers delimiting the reasoning segment of an assistant response
pub mod thinking {
    /// Opens the thinking segment
    pub const OPEN: &str = "<think>";

    /// Closes the thinking segment; its token id is the end-of-thinking sentinel
    pub const CLOSE: &str = "</think>";

    /// Text whose second token is the end-of-thinking sentinel
    pub const SENTINEL_PROBE: &str = "<think></think>";
}

/// Reserved delimiters of the DeepSeek-R1 conversation template
pub mod delimiters {
    pub const BOS: &str = "<｜begin▁of▁sentence｜>";
    pub const EOS: &str = "<｜end▁of▁sentence｜>";
    pub const USER: &str = "<｜User｜>";
    pub const ASSISTANT: &str = "<｜Assistant｜>";

    /// Every delimiter that must never appear in message content or displayed text
    pub const ROLE_DELIMITERS: [&str; 4] = [BOS, EOS, USER, ASSISTANT];
}

/// Labels emitted with `loading` status events
pub mod labels {
    pub const LOADING_MODEL: &str = "Loading model...";
    pub const COMPILING: &str = "Compiling shaders and warming up model...";
    pub const WARMING_UP: &str = "Warming up model...";
}
