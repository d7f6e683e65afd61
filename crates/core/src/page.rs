//! Installation and start page descriptions
//!
//! A page is a serializable list of components. Input components carry a name;
//! the page's submit button lists, in order, the names whose values are passed
//! to the lifecycle hook it triggers. Rendering is the host's business: the CLI
//! prints pages as text or JSON and collects values from flags.

use crate::config::InstallLocation;
use crate::errors::{ConfigError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Input name of the install-location chooser
pub const INSTALL_LOCATION: &str = "install_location";

/// Hook a button triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Start,
}

/// One selectable value of a dropdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// Page building block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Component {
    Markdown {
        text: String,
    },
    InstallLocation {
        choices: Vec<InstallLocation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<InstallLocation>,
        allow_work: bool,
    },
    Dropdown {
        name: String,
        label: String,
        choices: Vec<Choice>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Textbox {
        name: String,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        placeholder: Option<String>,
    },
    Button {
        label: String,
        action: Action,
        inputs: Vec<String>,
    },
    /// Where the host shows the hook's event stream
    Log,
}

impl Component {
    /// Input name, for components that produce a value
    pub fn input_name(&self) -> Option<&str> {
        match self {
            Component::InstallLocation { .. } => Some(INSTALL_LOCATION),
            Component::Dropdown { name, .. } | Component::Textbox { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Check a submitted value, filling in the default when none was given
    fn accept(&self, name: &str, value: Option<&str>) -> Result<String> {
        match self {
            Component::InstallLocation {
                choices, default, ..
            } => {
                let location = match value {
                    Some(v) => v.parse::<InstallLocation>()?,
                    None => (*default).ok_or_else(|| ConfigError::MissingInput {
                        input: name.to_string(),
                    })?,
                };
                if !choices.contains(&location) {
                    return Err(ConfigError::InvalidChoice {
                        input: name.to_string(),
                        value: location.to_string(),
                        choices: choices.iter().map(|c| c.to_string()).collect(),
                    }
                    .into());
                }
                Ok(location.to_string())
            }
            Component::Dropdown {
                choices, default, ..
            } => {
                let value = match value.map(str::to_string).or_else(|| default.clone()) {
                    Some(v) => v,
                    None => {
                        return Err(ConfigError::MissingInput {
                            input: name.to_string(),
                        }
                        .into())
                    }
                };
                if !choices.iter().any(|c| c.value == value) {
                    return Err(ConfigError::InvalidChoice {
                        input: name.to_string(),
                        value,
                        choices: choices.iter().map(|c| c.value.clone()).collect(),
                    }
                    .into());
                }
                Ok(value)
            }
            Component::Textbox { .. } => Ok(value.unwrap_or_default().to_string()),
            _ => Err(ConfigError::Validation {
                message: format!("component '{}' takes no input", name),
            }
            .into()),
        }
    }
}

/// Values collected from a page, in the order its button declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormValues {
    values: IndexMap<String, String>,
}

impl FormValues {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value that must be present
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            ConfigError::MissingInput {
                input: name.to_string(),
            }
            .into()
        })
    }

    pub fn install_location(&self) -> Result<InstallLocation> {
        Ok(self.require(INSTALL_LOCATION)?.parse()?)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A renderable page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub title: String,
    pub components: Vec<Component>,
}

impl Page {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            components: Vec::new(),
        }
    }

    pub fn markdown(&mut self, text: impl Into<String>) {
        self.components
            .push(Component::Markdown { text: text.into() });
    }

    /// Add the install-location chooser and return its input name
    ///
    /// Only the instance-local root is offered unless `allow_work` is set. The
    /// current location, when known and offered, becomes the default; a single
    /// choice is its own default.
    pub fn install_location(&mut self, allow_work: bool, current: Option<InstallLocation>) -> String {
        let choices = InstallLocation::choices(allow_work);
        let default = current
            .filter(|c| choices.contains(c))
            .or_else(|| (choices.len() == 1).then(|| choices[0]));
        self.components.push(Component::InstallLocation {
            choices,
            default,
            allow_work,
        });
        INSTALL_LOCATION.to_string()
    }

    pub fn dropdown(
        &mut self,
        name: &str,
        label: &str,
        choices: Vec<Choice>,
        default: Option<&str>,
    ) -> String {
        self.components.push(Component::Dropdown {
            name: name.to_string(),
            label: label.to_string(),
            choices,
            default: default.map(str::to_string),
        });
        name.to_string()
    }

    pub fn textbox(&mut self, name: &str, label: &str, placeholder: Option<&str>) -> String {
        self.components.push(Component::Textbox {
            name: name.to_string(),
            label: label.to_string(),
            placeholder: placeholder.map(str::to_string),
        });
        name.to_string()
    }

    pub fn installation_button(&mut self, inputs: Vec<String>) {
        self.components.push(Component::Button {
            label: "Install".to_string(),
            action: Action::Install,
            inputs,
        });
    }

    pub fn start_button(&mut self, inputs: Vec<String>) {
        self.components.push(Component::Button {
            label: "Start".to_string(),
            action: Action::Start,
            inputs,
        });
    }

    pub fn log(&mut self) {
        self.components.push(Component::Log);
    }

    /// The page's submit button
    pub fn button(&self) -> Option<(Action, &[String])> {
        self.components.iter().find_map(|c| match c {
            Component::Button { action, inputs, .. } => Some((*action, inputs.as_slice())),
            _ => None,
        })
    }

    /// Input names the button passes, in order
    pub fn inputs(&self) -> &[String] {
        self.button().map(|(_, inputs)| inputs).unwrap_or(&[])
    }

    fn component(&self, name: &str) -> Option<&Component> {
        self.components
            .iter()
            .find(|c| c.input_name() == Some(name))
    }

    pub fn has_log(&self) -> bool {
        self.components.iter().any(|c| matches!(c, Component::Log))
    }

    /// Check the page is wired consistently
    ///
    /// Exactly one button, a log area, every button input naming a declared
    /// control, and no duplicate input names.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| -> crate::errors::AppHubError {
            ConfigError::Validation { message }.into()
        };
        let buttons = self
            .components
            .iter()
            .filter(|c| matches!(c, Component::Button { .. }))
            .count();
        if buttons != 1 {
            return Err(invalid(format!(
                "page '{}' must have exactly one button, found {}",
                self.title, buttons
            )));
        }
        if !self.has_log() {
            return Err(invalid(format!("page '{}' has no log area", self.title)));
        }
        let mut seen = std::collections::HashSet::new();
        for name in self.components.iter().filter_map(Component::input_name) {
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate input '{}'", name)));
            }
        }
        for input in self.inputs() {
            if self.component(input).is_none() {
                return Err(invalid(format!(
                    "button input '{}' has no matching control",
                    input
                )));
            }
        }
        Ok(())
    }

    /// Validate submitted values against the button's inputs
    ///
    /// Every submitted name must be a button input; omitted inputs take the
    /// control's default. The result is ordered like the button's inputs.
    pub fn collect(&self, submitted: &IndexMap<String, String>) -> Result<FormValues> {
        self.validate()?;
        let inputs = self.inputs();
        if let Some(unknown) = submitted.keys().find(|k| !inputs.contains(*k)) {
            return Err(ConfigError::UnknownInput {
                input: unknown.clone(),
            }
            .into());
        }

        let mut values = IndexMap::new();
        for name in inputs {
            let component = self.component(name).ok_or_else(|| ConfigError::Validation {
                message: format!("button input '{}' has no matching control", name),
            })?;
            let value = component.accept(name, submitted.get(name).map(String::as_str))?;
            values.insert(name.clone(), value);
        }
        Ok(FormValues { values })
    }
}
