//! Command templates and their rendering into child-process argument lists.

use hs_optimizer::{ParameterSpace, Trial};
use hs_types::{ConfigError, ParameterValue};
use serde::{Deserialize, Serialize};

/// How boolean parameters appear on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoolStyle {
    /// `--flag True` / `--flag False`.
    #[default]
    Literal,
    /// `--flag` when true, nothing when false.
    Switch,
}

/// One element of a command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandToken {
    /// `${env}`: inject the orchestrating environment into the child.
    Env,
    /// `${interpreter}`
    Interpreter,
    /// `${program}`
    Program,
    /// `${args}`: every parameter as `--name value`.
    Args,
    /// `${args_no_hyphens}`: every parameter as `name=value`.
    ArgsNoHyphens,
    /// `${args_json}`: the whole assignment as one JSON argument.
    ArgsJson,
    /// `${name}`: the value of one parameter.
    Placeholder(String),
    Literal(String),
}

impl CommandToken {
    pub fn parse(raw: &str) -> Self {
        let Some(inner) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) else {
            return Self::Literal(raw.to_string());
        };
        match inner {
            "env" => Self::Env,
            "interpreter" => Self::Interpreter,
            "program" => Self::Program,
            "args" => Self::Args,
            "args_no_hyphens" => Self::ArgsNoHyphens,
            "args_json" => Self::ArgsJson,
            name => Self::Placeholder(name.to_string()),
        }
    }
}

/// A fully rendered child invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Whether the template asked for `${env}` injection.
    pub inject_env: bool,
}

impl RenderedCommand {
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

impl std::fmt::Display for RenderedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let quoted: Vec<String> = self
            .argv()
            .into_iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("'{arg}'")
                } else {
                    arg
                }
            })
            .collect();
        f.write_str(&quoted.join(" "))
    }
}

/// Ordered template tokens plus fixed trailing arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    tokens: Vec<CommandToken>,
    defaults: Vec<String>,
    program: Option<String>,
    interpreter: String,
    bool_style: BoolStyle,
}

impl CommandTemplate {
    pub fn new(tokens: Vec<CommandToken>) -> Self {
        Self {
            tokens,
            defaults: Vec::new(),
            program: None,
            interpreter: "python".to_string(),
            bool_style: BoolStyle::Literal,
        }
    }

    pub fn parse<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(raw.into_iter().map(|s| CommandToken::parse(s.as_ref())).collect())
    }

    /// `${env} ${interpreter} ${program} ${args}`
    pub fn standard() -> Self {
        Self::new(vec![
            CommandToken::Env,
            CommandToken::Interpreter,
            CommandToken::Program,
            CommandToken::Args,
        ])
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_defaults(mut self, defaults: Vec<String>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_bool_style(mut self, style: BoolStyle) -> Self {
        self.bool_style = style;
        self
    }

    pub fn injects_env(&self) -> bool {
        self.tokens.contains(&CommandToken::Env)
    }

    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().filter_map(|t| match t {
            CommandToken::Placeholder(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Load-time check that every placeholder is bound and the template
    /// produces an executable.
    pub fn validate(&self, space: &ParameterSpace) -> Result<(), ConfigError> {
        if let Some(name) = self.placeholders().find(|name| !space.contains(name)) {
            return Err(ConfigError::UnboundPlaceholder {
                name: name.to_string(),
            });
        }
        if self.program.is_none() && self.tokens.contains(&CommandToken::Program) {
            return Err(ConfigError::Invalid(
                "command uses ${program} but no program is defined".to_string(),
            ));
        }
        let has_executable = self.tokens.iter().any(|t| !matches!(t, CommandToken::Env));
        if !has_executable {
            return Err(ConfigError::Invalid("command has no executable".to_string()));
        }
        Ok(())
    }

    pub fn render(&self, trial: &Trial) -> Result<RenderedCommand, ConfigError> {
        let mut argv: Vec<String> = Vec::new();

        for token in &self.tokens {
            match token {
                CommandToken::Env => {}
                CommandToken::Interpreter => argv.push(self.interpreter.clone()),
                CommandToken::Program => match &self.program {
                    Some(program) => argv.push(program.clone()),
                    None => {
                        return Err(ConfigError::Invalid(
                            "command uses ${program} but no program is defined".to_string(),
                        ))
                    }
                },
                CommandToken::Args => {
                    for (name, value) in &trial.parameters {
                        match (self.bool_style, value) {
                            (BoolStyle::Switch, ParameterValue::Bool(true)) => {
                                argv.push(format!("--{name}"))
                            }
                            (BoolStyle::Switch, ParameterValue::Bool(false)) => {}
                            _ => {
                                argv.push(format!("--{name}"));
                                argv.push(value.render());
                            }
                        }
                    }
                }
                CommandToken::ArgsNoHyphens => {
                    argv.extend(
                        trial
                            .parameters
                            .iter()
                            .map(|(name, value)| format!("{name}={value}")),
                    );
                }
                CommandToken::ArgsJson => {
                    let object: serde_json::Map<String, serde_json::Value> = trial
                        .parameters
                        .iter()
                        .map(|(name, value)| (name.clone(), value.to_json()))
                        .collect();
                    argv.push(serde_json::Value::Object(object).to_string());
                }
                CommandToken::Placeholder(name) => {
                    let value = trial.parameters.get(name).ok_or_else(|| {
                        ConfigError::UnboundPlaceholder { name: name.clone() }
                    })?;
                    self.push_value(&mut argv, value);
                }
                CommandToken::Literal(text) => argv.push(text.clone()),
            }
        }

        argv.extend(self.defaults.iter().cloned());

        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .ok_or_else(|| ConfigError::Invalid("command renders to nothing".to_string()))?;

        Ok(RenderedCommand {
            program,
            args: argv.collect(),
            inject_env: self.injects_env(),
        })
    }

    /// In switch style a `--flag ${bool}` pair collapses to `--flag` or
    /// disappears entirely.
    fn push_value(&self, argv: &mut Vec<String>, value: &ParameterValue) {
        let preceded_by_flag = argv.last().is_some_and(|a| a.starts_with("--"));
        match (self.bool_style, value.as_bool()) {
            (BoolStyle::Switch, Some(true)) if preceded_by_flag => {}
            (BoolStyle::Switch, Some(false)) if preceded_by_flag => {
                argv.pop();
            }
            _ => argv.push(value.render()),
        }
    }
}
