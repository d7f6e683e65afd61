//! ComfyUI
//!
//! Installs ComfyUI from its git repository into the chosen install root,
//! either on conda's `base` environment or on a dedicated prefix environment
//! under the root, optionally with a set of custom-node extensions. Starting
//! it can attach a shared model bundle before launching the web server as a
//! daemon on port 23810.

use crate::app::{App, AppContext};
use crate::assets::BARE;
use crate::config::{AppConfig, InstallLocation};
use crate::errors::{ConfigError, Result};
use crate::page::{Choice, FormValues, Page};
use crate::settings::Settings;
use async_trait::async_trait;
use std::path::Path;
use tracing::{info, instrument, warn};

const REPOSITORY: &str = "https://github.com/comfyanonymous/ComfyUI";
const PYTHON_VERSION: &str = "3.10";

/// Install directory of the ComfyUI checkout, relative to the install root
const CHECKOUT: &str = "ComfyUI";

/// Flags the launch command sets itself
const FIXED_FLAGS: &[&str] = &["--listen", "--port"];

/// Python environment ComfyUI runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PythonEnv {
    /// conda's base environment
    Base,
    /// A prefix environment at `<root>/env`
    Dedicated,
}

impl PythonEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            PythonEnv::Base => "base",
            PythonEnv::Dedicated => "dedicated",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "base" => Ok(PythonEnv::Base),
            "dedicated" => Ok(PythonEnv::Dedicated),
            other => Err(ConfigError::InvalidChoice {
                input: "python_env".to_string(),
                value: other.to_string(),
                choices: vec!["base".to_string(), "dedicated".to_string()],
            }
            .into()),
        }
    }

    /// Name or prefix passed to `conda_activate`
    pub fn activation_target(&self, root: &Path) -> String {
        match self {
            PythonEnv::Base => "base".to_string(),
            PythonEnv::Dedicated => root.join("env").display().to_string(),
        }
    }
}

/// A custom-node repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension {
    pub name: &'static str,
    pub repository: &'static str,
}

pub const MANAGER: Extension = Extension {
    name: "ComfyUI-Manager",
    repository: "https://github.com/ltdrdata/ComfyUI-Manager",
};

const RECOMMENDED: &[Extension] = &[
    MANAGER,
    Extension {
        name: "ComfyUI-Custom-Scripts",
        repository: "https://github.com/pythongosssss/ComfyUI-Custom-Scripts",
    },
    Extension {
        name: "rgthree-comfy",
        repository: "https://github.com/rgthree/rgthree-comfy",
    },
    Extension {
        name: "was-node-suite-comfyui",
        repository: "https://github.com/WASasquatch/was-node-suite-comfyui",
    },
];

/// Extensions installed alongside ComfyUI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionSet {
    None,
    Manager,
    Recommended,
}

impl ExtensionSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionSet::None => "none",
            ExtensionSet::Manager => "manager",
            ExtensionSet::Recommended => "recommended",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(ExtensionSet::None),
            "manager" => Ok(ExtensionSet::Manager),
            "recommended" => Ok(ExtensionSet::Recommended),
            other => Err(ConfigError::InvalidChoice {
                input: "extension_set".to_string(),
                value: other.to_string(),
                choices: vec![
                    "none".to_string(),
                    "manager".to_string(),
                    "recommended".to_string(),
                ],
            }
            .into()),
        }
    }

    pub fn extensions(&self) -> &'static [Extension] {
        match self {
            ExtensionSet::None => &[],
            ExtensionSet::Manager => &RECOMMENDED[..1],
            ExtensionSet::Recommended => RECOMMENDED,
        }
    }
}

/// Typed installation-page values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComfyuiInstallOptions {
    pub install_location: InstallLocation,
    pub python_env: PythonEnv,
    pub extension_set: ExtensionSet,
}

impl ComfyuiInstallOptions {
    pub fn from_form(form: &FormValues) -> Result<Self> {
        Ok(Self {
            install_location: form.install_location()?,
            python_env: PythonEnv::parse(form.require("python_env")?)?,
            extension_set: ExtensionSet::parse(form.require("extension_set")?)?,
        })
    }
}

/// Typed start-page values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComfyuiStartOptions {
    /// Asset bundle name, or `bare`
    pub mount_models: String,
    pub extra_args: Vec<String>,
}

impl ComfyuiStartOptions {
    pub fn from_form(form: &FormValues) -> Result<Self> {
        let raw = form.get("extra_args").unwrap_or_default();
        let extra_args = shell_words::split(raw).map_err(|e| ConfigError::Validation {
            message: format!("cannot parse extra arguments '{}': {}", raw, e),
        })?;
        Ok(Self {
            mount_models: form.require("mount_models")?.to_string(),
            extra_args,
        })
    }

    /// Extra arguments that repeat a flag the launch command already sets
    pub fn colliding_flags(&self) -> Vec<&str> {
        self.extra_args
            .iter()
            .map(String::as_str)
            .filter(|arg| {
                FIXED_FLAGS
                    .iter()
                    .any(|flag| arg == flag || arg.starts_with(&format!("{}=", flag)))
            })
            .collect()
    }
}

/// `python main.py` bound to all interfaces on `port`
pub fn launch_command(port: u16, extra_args: &[String]) -> String {
    let mut command = format!("python main.py --listen 0.0.0.0 --port {}", port);
    if !extra_args.is_empty() {
        command.push(' ');
        command.push_str(&shell_words::join(extra_args));
    }
    command
}

/// ComfyUI-Manager settings written at install time
fn manager_config() -> &'static str {
    "[default]\n\
     preview_method = none\n\
     security_level = normal\n\
     network_mode = public\n\
     update_policy = stable-comfyui\n\
     file_logging = True\n"
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.display().to_string()).into_owned()
}

/// The ComfyUI app
#[derive(Debug, Clone)]
pub struct Comfyui {
    port: u16,
    op_port: u16,
}

impl Comfyui {
    pub const KEY: &'static str = "comfyui";
    pub const PORT: u16 = 23810;
    pub const OP_PORT: u16 = 38965;

    pub fn new() -> Self {
        Self::with_ports(Self::PORT, Self::OP_PORT)
    }

    /// Same app on other ports
    pub fn with_ports(port: u16, op_port: u16) -> Self {
        Self { port, op_port }
    }
}

impl Default for Comfyui {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl App for Comfyui {
    fn key(&self) -> &str {
        Self::KEY
    }

    fn name(&self) -> &str {
        "ComfyUI"
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn op_port(&self) -> u16 {
        self.op_port
    }

    fn render_installation_page(&self, cfg: Option<&AppConfig>) -> Page {
        let mut page = Page::new("Install ComfyUI");
        page.markdown(
            "# Install ComfyUI\n\n\
             ComfyUI is a node-based interface for diffusion models. Installing on the \
             work volume keeps it across instances.",
        );
        let location = page.install_location(true, cfg.map(|c| c.install_location));
        let python_env = page.dropdown(
            "python_env",
            "Python environment",
            vec![
                Choice::new("base", "Reuse conda base"),
                Choice::new("dedicated", "Create a dedicated environment"),
            ],
            Some(cfg.and_then(|c| c.option("python_env")).unwrap_or("base")),
        );
        let extension_set = page.dropdown(
            "extension_set",
            "Extensions",
            vec![
                Choice::new("none", "None"),
                Choice::new("manager", "ComfyUI-Manager"),
                Choice::new("recommended", "Manager and recommended nodes"),
            ],
            Some(cfg.and_then(|c| c.option("extension_set")).unwrap_or("none")),
        );
        page.installation_button(vec![location, python_env, extension_set]);
        page.log();
        page
    }

    #[instrument(skip_all, fields(app = Self::KEY))]
    async fn installation(&self, ctx: &mut AppContext<'_>, form: &FormValues) -> Result<()> {
        let options = ComfyuiInstallOptions::from_form(form)?;
        let root = ctx.record_install_location(options.install_location)?;
        ctx.record_option("python_env", options.python_env.as_str());
        ctx.record_option("extension_set", options.extension_set.as_str());

        ctx.set_env("PIP_CACHE_DIR", root.join(".cache").join("pip").display().to_string());
        ctx.set_env(
            "CONDA_PKGS_DIRS",
            root.join(".cache").join("conda").join("pkgs").display().to_string(),
        );

        if options.python_env == PythonEnv::Dedicated {
            let conda = ctx.settings().conda.root.join("bin").join("conda");
            let command = format!(
                "{} create -p {} python={} -y",
                quote_path(&conda),
                quote_path(&root.join("env")),
                PYTHON_VERSION
            );
            ctx.execute_command(&command, None).await?;
        }

        {
            let mut env = ctx.conda_activate(&options.python_env.activation_target(&root));
            env.execute_command(&format!("git clone {} {}", REPOSITORY, CHECKOUT), None)
                .await?;
            env.execute_command("pip install -r requirements.txt", Some(CHECKOUT))
                .await?;

            let nodes = format!("{}/custom_nodes", CHECKOUT);
            for extension in options.extension_set.extensions() {
                env.execute_command(
                    &format!("git clone {} {}", extension.repository, extension.name),
                    Some(nodes.as_str()),
                )
                .await?;
                env.execute_command(
                    "if [ -f requirements.txt ]; then pip install -r requirements.txt; fi",
                    Some(format!("{}/{}", nodes, extension.name).as_str()),
                )
                .await?;
            }
        }

        if options.extension_set.extensions().contains(&MANAGER) {
            let path = root
                .join(CHECKOUT)
                .join("custom_nodes")
                .join(MANAGER.name)
                .join("config.ini");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, manager_config())?;
            info!("Wrote {}", path.display());
        }

        ctx.app_installed()
    }

    fn render_start_page(&self, _cfg: &AppConfig, settings: &Settings) -> Page {
        let mut page = Page::new("Start ComfyUI");
        page.markdown(format!(
            "# Start ComfyUI\n\nThe web interface listens on port {}.",
            self.port
        ));
        let mut choices = vec![Choice::new(BARE, "No shared models")];
        choices.extend(
            settings
                .assets
                .bundles
                .iter()
                .map(|b| Choice::new(b.name.clone(), b.label.clone())),
        );
        let mount_models = page.dropdown("mount_models", "Shared models", choices, Some(BARE));
        let extra_args = page.textbox(
            "extra_args",
            "Extra launch arguments",
            Some("--lowvram --preview-method auto"),
        );
        page.start_button(vec![mount_models, extra_args]);
        page.log();
        page
    }

    #[instrument(skip_all, fields(app = Self::KEY))]
    async fn start(&self, ctx: &mut AppContext<'_>, form: &FormValues) -> Result<()> {
        let options = ComfyuiStartOptions::from_form(form)?;
        let root = ctx.install_root();

        let collisions = options.colliding_flags();
        if !collisions.is_empty() {
            let text = format!(
                "Extra arguments {} repeat flags set by the launcher; the service may not listen on port {}",
                collisions.join(" "),
                self.port
            );
            warn!("{}", text);
            ctx.log("warn", text);
        }

        let models = root.join(CHECKOUT).join("models");
        ctx.attach_assets(&options.mount_models, &models).await?;

        let python_env = match ctx.config().option("python_env") {
            Some(value) => PythonEnv::parse(value)?,
            None => PythonEnv::Base,
        };
        let mut env = ctx.conda_activate(&python_env.activation_target(&root));
        let command = launch_command(self.port, &options.extra_args);
        let handle = env.spawn_daemon(&command, Some(CHECKOUT)).await?;
        env.wait_until_ready(&handle).await?;
        env.app_started(&handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Component;
    use indexmap::IndexMap;

    fn submitted(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identity() {
        let app = Comfyui::new();
        assert_eq!(app.key(), "comfyui");
        assert_eq!(app.name(), "ComfyUI");
        assert_eq!(app.port(), 23810);
        assert_eq!(app.op_port(), 38965);
    }

    #[test]
    fn test_installation_page_layout() {
        let page = Comfyui::new().render_installation_page(None);
        page.validate().unwrap();
        assert!(matches!(page.components[0], Component::Markdown { .. }));
        assert!(matches!(
            page.components[1],
            Component::InstallLocation {
                allow_work: true,
                ..
            }
        ));
        assert_eq!(
            page.inputs(),
            &["install_location", "python_env", "extension_set"]
        );
        assert!(matches!(page.components.last(), Some(Component::Log)));
    }

    #[test]
    fn test_installation_page_defaults_from_config() {
        let cfg = AppConfig::new("comfyui", InstallLocation::Work)
            .with_option("extension_set", "recommended");
        let page = Comfyui::new().render_installation_page(Some(&cfg));
        let form = page.collect(&IndexMap::new()).unwrap();
        let options = ComfyuiInstallOptions::from_form(&form).unwrap();
        assert_eq!(options.install_location, InstallLocation::Work);
        assert_eq!(options.python_env, PythonEnv::Base);
        assert_eq!(options.extension_set, ExtensionSet::Recommended);
    }

    #[test]
    fn test_start_page_lists_bundles() {
        let settings = Settings::default();
        let cfg = AppConfig::new("comfyui", InstallLocation::Local);
        let page = Comfyui::new().render_start_page(&cfg, &settings);
        page.validate().unwrap();
        assert_eq!(page.inputs(), &["mount_models", "extra_args"]);
        match &page.components[1] {
            Component::Dropdown {
                choices, default, ..
            } => {
                let values: Vec<&str> = choices.iter().map(|c| c.value.as_str()).collect();
                assert_eq!(values, vec!["bare", "sd15", "sdxl"]);
                assert_eq!(default.as_deref(), Some("bare"));
            }
            other => panic!("unexpected component {:?}", other),
        }
    }

    #[test]
    fn test_start_options_split_and_flag_collisions() {
        let settings = Settings::default();
        let cfg = AppConfig::new("comfyui", InstallLocation::Local);
        let page = Comfyui::new().render_start_page(&cfg, &settings);
        let form = page
            .collect(&submitted(&[(
                "extra_args",
                "--lowvram --port=8188 --output-directory '/data/my outputs'",
            )]))
            .unwrap();
        let options = ComfyuiStartOptions::from_form(&form).unwrap();
        assert_eq!(options.mount_models, "bare");
        assert_eq!(
            options.extra_args,
            vec![
                "--lowvram",
                "--port=8188",
                "--output-directory",
                "/data/my outputs"
            ]
        );
        assert_eq!(options.colliding_flags(), vec!["--port=8188"]);
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        let settings = Settings::default();
        let cfg = AppConfig::new("comfyui", InstallLocation::Local);
        let page = Comfyui::new().render_start_page(&cfg, &settings);
        let form = page
            .collect(&submitted(&[("extra_args", "--output-directory '/data")]))
            .unwrap();
        assert!(ComfyuiStartOptions::from_form(&form).is_err());
    }

    #[test]
    fn test_launch_command() {
        assert_eq!(
            launch_command(23810, &[]),
            "python main.py --listen 0.0.0.0 --port 23810"
        );
        assert_eq!(
            launch_command(23810, &["--lowvram".to_string(), "a b".to_string()]),
            "python main.py --listen 0.0.0.0 --port 23810 --lowvram 'a b'"
        );
    }

    #[test]
    fn test_extension_sets() {
        assert!(ExtensionSet::None.extensions().is_empty());
        assert_eq!(ExtensionSet::Manager.extensions(), &[MANAGER]);
        let recommended = ExtensionSet::Recommended.extensions();
        assert_eq!(recommended.len(), 4);
        assert_eq!(recommended[0], MANAGER);
    }

    #[test]
    fn test_dedicated_env_lives_under_root() {
        let root = Path::new("/root/apps/comfyui");
        assert_eq!(PythonEnv::Base.activation_target(root), "base");
        assert_eq!(
            PythonEnv::Dedicated.activation_target(root),
            "/root/apps/comfyui/env"
        );
    }
}
