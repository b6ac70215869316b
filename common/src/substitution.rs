// Variable expansion for step commands, scripts, env values and paths.
//
// Rules: `${NAME}` is replaced from the merged environment; `$$` yields a
// literal `$`; references to undefined variables are left verbatim so plain
// shell `$VAR` usage inside commands survives untouched.

use regex::Regex;
use std::collections::HashMap;

pub struct VariableExpander {
    placeholder: Regex,
}

impl Default for VariableExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableExpander {
    pub fn new() -> Self {
        // `$$` is captured ahead of `${NAME}` so escapes win
        let placeholder = Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
            .unwrap_or_else(|_| unreachable!("placeholder pattern is static"));
        Self { placeholder }
    }

    /// Expand every `${NAME}` reference found in `template`
    pub fn expand(&self, template: &str, variables: &HashMap<String, String>) -> String {
        self.placeholder
            .replace_all(template, |caps: &regex::Captures<'_>| {
                match caps.get(1) {
                    None => "$".to_string(),
                    Some(name) => match variables.get(name.as_str()) {
                        Some(value) => value.clone(),
                        // Leave unknown references for the shell to interpret
                        None => caps[0].to_string(),
                    },
                }
            })
            .into_owned()
    }

    /// Expand every value of an environment map in place
    pub fn expand_env(
        &self,
        env: &HashMap<String, String>,
        variables: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        env.iter()
            .map(|(k, v)| (k.clone(), self.expand(v, variables)))
            .collect()
    }
}
