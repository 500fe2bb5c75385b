use anyhow::{Context, Result};
use serde::{Serialize, Deserialize};
use serde_json::{Value as Json, Map as JsonMap};
use std::path::Path;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner { Terraform, Tofu }

pub fn pick_runner(prefer: Option<Runner>) -> Result<Runner> {
    if let Some(p) = prefer { return Ok(p); }
    if which::which("tofu").is_ok() { Ok(Runner::Tofu) }
    else if which::which("terraform").is_ok() { Ok(Runner::Terraform) }
    else { anyhow::bail!("Neither 'tofu' nor 'terraform' found in PATH") }
}

fn bin(r: Runner) -> &'static str { match r { Runner::Terraform => "terraform", Runner::Tofu => "tofu" } }

/// Kind of change Terraform proposes for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action { NoOp, Create, Read, Update, Delete, Forget }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub before: Option<Json>,
    /// Planned attribute values; absent or null for deletes.
    #[serde(default)]
    pub after: Option<JsonMap<String, Json>>,
}

impl Change {
    pub fn has(&self, action: Action) -> bool { self.actions.contains(&action) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    #[serde(default)]
    pub address: String,
    #[serde(rename="type")]
    pub type_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub change: Option<Change>,
}

impl ResourceChange {
    pub fn creates(&self, type_name: &str) -> bool {
        self.type_name == type_name && self.change.as_ref().is_some_and(|c| c.has(Action::Create))
    }

    pub fn after(&self) -> Option<&JsonMap<String, Json>> {
        self.change.as_ref().and_then(|c| c.after.as_ref())
    }
}

/// The subset of `terraform show -json` output this workspace reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub format_version: Option<String>,
    #[serde(default)]
    pub terraform_version: Option<String>,
    #[serde(default)]
    pub resource_changes: Vec<ResourceChange>,
}

impl Plan {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Plan> {
        serde_json::from_slice(bytes).context("decode terraform plan json")
    }
}

/// Reads the string list stored under `key`; anything else reads as empty.
pub fn string_list(attrs: &JsonMap<String, Json>, key: &str) -> Vec<String> {
    attrs.get(key)
        .and_then(Json::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// `.json` files are read as-is; anything else is treated as a binary plan and exported via `show -json`.
pub fn load_plan(path: &Path, prefer: Option<Runner>) -> Result<Plan> {
    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        let bytes = std::fs::read(path).with_context(|| format!("read plan {}", path.display()))?;
        return Plan::from_json_slice(&bytes);
    }
    let runner = pick_runner(prefer)?;
    show_plan_json(runner, path)
}

pub fn show_plan_json(r: Runner, plan_file: &Path) -> Result<Plan> {
    let dir = plan_file.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file = plan_file.file_name().context("plan path has no file name")?;
    debug!(runner = bin(r), plan = %plan_file.display(), "exporting plan as json");
    let out = Command::new(bin(r)).arg(format!("-chdir={}", dir.display()))
        .arg("show").arg("-json").arg(file)
        .output()
        .context("spawn show")?;
    if !out.status.success() {
        anyhow::bail!("show failed: {}", String::from_utf8_lossy(&out.stderr).trim())
    }
    Plan::from_json_slice(&out.stdout)
}
