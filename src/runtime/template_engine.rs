//! Jinja2 template engine for chat templates using minijinja

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use minijinja::{context, Environment, Value};
use regex::Regex;

use crate::constants::delimiters;
use crate::protocol::ChatMessage;

/// DeepSeek-R1 distill conversation template.
///
/// Prior assistant turns keep only the text after the last `</think>`, the
/// same reduction the model's published template performs.
pub const DEEPSEEK_R1_TEMPLATE: &str = r#"{{ bos_token }}
{%- for message in messages -%}
{%- if message['role'] == 'user' -%}
{{ '<｜User｜>' + message['content'] }}
{%- elif message['role'] == 'assistant' -%}
{%- set content = message['content'] -%}
{%- if '</think>' in content -%}
{%- set content = content.split('</think>')[-1] -%}
{%- endif -%}
{{ '<｜Assistant｜>' + content + eos_token }}
{%- else -%}
{{ raise_exception('Only user and assistant roles are supported') }}
{%- endif -%}
{%- endfor -%}
{%- if add_generation_prompt -%}
{{ '<｜Assistant｜>' }}
{%- endif -%}"#;

lazy_static! {
    // Rust regex has no backreferences, so single and double quotes are separate patterns
    static ref SPLIT_SINGLE: Regex = Regex::new(r"\.split\('([^']*)'\)\[(-?\d+)\]")
        .unwrap_or_else(|e| panic!("invalid split pattern: {e}"));
    static ref SPLIT_DOUBLE: Regex = Regex::new(r#"\.split\("([^"]*)"\)\[(-?\d+)\]"#)
        .unwrap_or_else(|e| panic!("invalid split pattern: {e}"));
}

/// Template string and the special tokens it refers to
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    /// The Jinja2 chat template string
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
    /// Default for callers that don't specify
    pub add_generation_prompt: bool,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            chat_template: None,
            bos_token: None,
            eos_token: None,
            add_generation_prompt: true,
        }
    }
}

impl TemplateConfig {
    /// Configuration matching the DeepSeek-R1 distill tokenizer
    pub fn deepseek_r1() -> Self {
        Self {
            chat_template: Some(DEEPSEEK_R1_TEMPLATE.to_owned()),
            bos_token: Some(delimiters::BOS.to_owned()),
            eos_token: Some(delimiters::EOS.to_owned()),
            add_generation_prompt: true,
        }
    }
}

/// Compiled-on-demand chat template renderer
pub struct ChatTemplate {
    env: Environment<'static>,
    config: TemplateConfig,
}

impl ChatTemplate {
    pub fn new(config: TemplateConfig) -> Self {
        let mut env = Environment::new();

        env.add_filter("split_first", split_first_filter);
        env.add_filter("split_last", split_last_filter);
        env.add_function("raise_exception", raise_exception_fn);

        Self { env, config }
    }

    pub fn deepseek_r1() -> Self {
        Self::new(TemplateConfig::deepseek_r1())
    }

    /// Render `messages` to the prompt string fed to the tokenizer.
    pub fn apply(&self, messages: &[ChatMessage], add_generation_prompt: Option<bool>) -> Result<String> {
        let template_str = self
            .config
            .chat_template
            .as_ref()
            .ok_or_else(|| anyhow!("No chat template configured"))?;

        // Python's `.split(sep)[i]` has no minijinja equivalent
        let transformed = transform_split_calls(template_str);

        let tmpl = self
            .env
            .template_from_str(&transformed)
            .map_err(|e| anyhow!("Template compilation failed: {}", e))?;

        let add_gen = add_generation_prompt.unwrap_or(self.config.add_generation_prompt);

        let rendered = tmpl.render(context! {
            messages => messages,
            bos_token => self.config.bos_token.as_deref().unwrap_or(""),
            eos_token => self.config.eos_token.as_deref().unwrap_or(""),
            add_generation_prompt => add_gen,
        })?;

        Ok(rendered)
    }
}

fn raise_exception_fn(msg: String) -> Result<Value, minijinja::Error> {
    Err(minijinja::Error::new(
        minijinja::ErrorKind::InvalidOperation,
        msg,
    ))
}

/// Python's .split(sep)[0]
fn split_first_filter(value: &Value, sep: &str) -> Result<Value, minijinja::Error> {
    if let Some(s) = value.as_str() {
        Ok(Value::from(s.split(sep).next().unwrap_or("")))
    } else {
        Ok(value.clone())
    }
}

/// Python's .split(sep)[-1]
fn split_last_filter(value: &Value, sep: &str) -> Result<Value, minijinja::Error> {
    if let Some(s) = value.as_str() {
        Ok(Value::from(s.rsplit(sep).next().unwrap_or("")))
    } else {
        Ok(value.clone())
    }
}

/// `.split('sep')[0]` → `|split_first('sep')`, `.split('sep')[-1]` → `|split_last('sep')`
fn transform_split_calls(template: &str) -> String {
    let result = SPLIT_SINGLE.replace_all(template, |caps: &regex::Captures| {
        split_replacement(&caps[1], &caps[2])
    });
    let result = SPLIT_DOUBLE.replace_all(&result, |caps: &regex::Captures| {
        split_replacement(&caps[1], &caps[2])
    });
    result.into_owned()
}

fn split_replacement(sep: &str, idx_str: &str) -> String {
    let idx: i64 = idx_str.parse().unwrap_or(0);
    match idx {
        0 => format!("|split_first('{sep}')"),
        -1 => format!("|split_last('{sep}')"),
        _ => format!(".split('{sep}')[{idx}]"), // unsupported indices stay as written
    }
}
