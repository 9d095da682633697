//! Gate definition sources.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::debug;

use crate::core::types::GateDefinition;

const GATE_SCHEMA: &str = include_str!("../../schemas/gate/v1.schema.json");

static GATE_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema_value: Value =
        serde_json::from_str(GATE_SCHEMA).map_err(|err| format!("parse gate schema: {err}"))?;
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema_value)
        .map_err(|err| format!("compile gate schema: {err}"))
});

/// The bundled gate schema, compiled on first use.
fn gate_schema() -> Result<&'static Validator> {
    GATE_VALIDATOR.as_ref().map_err(|err| anyhow!("{err}"))
}

/// Source of gate definitions.
///
/// `Ok(None)` means the gate does not exist; `Err` means it exists but could not
/// be loaded (unreadable or malformed).
pub trait GateProvider: Send + Sync {
    fn load_gate(&self, id: &str) -> Result<Option<GateDefinition>>;

    /// Gates served by this provider are inline/ephemeral definitions.
    fn is_ephemeral(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct InMemoryGateProvider {
    gates: RwLock<HashMap<String, GateDefinition>>,
}

impl InMemoryGateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gates(gates: impl IntoIterator<Item = GateDefinition>) -> Self {
        let provider = Self::new();
        for gate in gates {
            provider.insert(gate);
        }
        provider
    }

    pub fn insert(&self, gate: GateDefinition) {
        self.gates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(gate.id.clone(), gate);
    }
}

impl GateProvider for InMemoryGateProvider {
    fn load_gate(&self, id: &str) -> Result<Option<GateDefinition>> {
        Ok(self
            .gates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned())
    }
}

/// Reads `<dir>/<id>.json` and checks it against the bundled gate schema.
pub struct FsGateProvider {
    dir: PathBuf,
    schema: &'static Validator,
}

impl FsGateProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            schema: gate_schema()?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            bail!("invalid gate id '{id}'");
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

impl GateProvider for FsGateProvider {
    fn load_gate(&self, id: &str) -> Result<Option<GateDefinition>> {
        let path = self.path_for(id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "gate definition not found");
                return Ok(None);
            }
            Err(err) => return Err(err).with_context(|| format!("read gate {}", path.display())),
        };
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse gate {}", path.display()))?;
        validate_gate_document(self.schema, &value)
            .with_context(|| format!("validate gate {}", path.display()))?;
        let gate: GateDefinition = serde_json::from_value(value)
            .with_context(|| format!("deserialize gate {}", path.display()))?;
        if gate.id != id {
            bail!("gate file {} declares id '{}'", path.display(), gate.id);
        }
        Ok(Some(gate))
    }
}

/// Validate a gate document against the bundled schema.
pub fn validate_gate_value(value: &Value) -> Result<()> {
    validate_gate_document(gate_schema()?, value)
}

fn validate_gate_document(schema: &Validator, value: &Value) -> Result<()> {
    let messages: Vec<String> = schema.iter_errors(value).map(|err| err.to_string()).collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
