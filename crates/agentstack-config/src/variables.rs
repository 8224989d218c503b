//! Variable interpolation for app configurations.
//!
//! Supports variables like:
//! - `${app}` - App name
//! - `${account}` - Target account id
//! - `${region}` - Target region
//! - `${env.VAR_NAME}` - Environment variable
//!
//! Unknown variables are left in place so that a typo shows up verbatim in
//! the rendered stack instead of silently becoming an empty string.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Environment variable consulted for the target account.
pub const ACCOUNT_ENV: &str = "CDK_DEFAULT_ACCOUNT";
/// Environment variable consulted for the target region.
pub const REGION_ENV: &str = "CDK_DEFAULT_REGION";

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

/// Variables available for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub app: Option<String>,
    pub account: Option<String>,
    pub region: Option<String>,
    /// Environment variables
    pub env: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context populated from the current process environment.
    pub fn from_process_env() -> Self {
        let mut ctx = Self::new();
        ctx.populate_env();
        ctx
    }

    /// Populate environment variables from the current process environment.
    pub fn populate_env(&mut self) {
        for (key, value) in std::env::vars() {
            self.env.insert(key, value);
        }
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["app"] => self.app.clone(),
            ["account"] => self.account.clone(),
            ["region"] => self.region.clone(),
            ["env", name] => self.env.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Names of variables in `input` that have no value.
    pub fn unresolved_in(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }

    /// Account from the environment fallback variable.
    pub fn default_account(&self) -> Option<String> {
        self.env.get(ACCOUNT_ENV).filter(|v| !v.is_empty()).cloned()
    }

    /// Region from the environment fallback variable.
    pub fn default_region(&self) -> Option<String> {
        self.env.get(REGION_ENV).filter(|v| !v.is_empty()).cloned()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.ctx.app = Some(app.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.ctx.account = Some(account.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.ctx.region = Some(region.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
