//! Shell interpreter sessions

use crate::compiler::{HostInfo, ScriptLimits};
use crate::context::ResponseSink;
use crate::shell::ast::FunctionDef;
use crate::shell::interpreter::{Fault, Interpreter};
use crate::shell::parser;
use crate::shell::value::{ShellValue, Table};
use nautilus_state::GlobalSnapshot;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle shared by sessions and the pool that owns them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, not yet opened
    BeforeOpen,
    /// Opening in progress
    Opening,
    /// Usable
    Opened,
    /// Shutting down
    Closing,
    /// Shut down
    Closed,
    /// Failed; must be replaced
    Broken,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeOpen => "before_open",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Broken => "broken",
        };
        f.write_str(name)
    }
}

/// Everything a new session is initialized from
#[derive(Debug, Clone)]
pub(crate) struct SessionSeed {
    pub(crate) globals: GlobalSnapshot,
    pub(crate) modules: Vec<(String, Arc<str>)>,
    pub(crate) host: HostInfo,
    pub(crate) limits: ScriptLimits,
}

/// One interpreter session: seed variables plus preloaded module functions
///
/// Sessions are held by one invocation at a time; nothing an invocation
/// defines outlives it.
pub struct ShellSession {
    id: u64,
    state: LifecycleState,
    pub(crate) variables: HashMap<String, ShellValue>,
    pub(crate) functions: HashMap<String, Arc<FunctionDef>>,
    modules: Vec<String>,
    invocations: u64,
}

impl ShellSession {
    /// Open a session: bind globals and the host object, then load modules
    pub(crate) fn open(id: u64, seed: &SessionSeed) -> Self {
        let mut session = Self {
            id,
            state: LifecycleState::Opening,
            variables: HashMap::new(),
            functions: HashMap::new(),
            modules: Vec::new(),
            invocations: 0,
        };

        for (name, entry) in seed.globals.iter() {
            session
                .variables
                .insert(name.to_ascii_lowercase(), ShellValue::from_json(&entry.value));
        }
        let host: Table = [
            ("Name".to_string(), ShellValue::Str(seed.host.name.clone())),
            ("Version".to_string(), ShellValue::Str(seed.host.version.clone())),
        ]
        .into_iter()
        .collect();
        session.variables.insert("host".to_string(), ShellValue::Table(host));

        for (name, source) in &seed.modules {
            if let Err(message) = session.load_module(source, &seed.limits) {
                warn!(session = id, module = %name, %message, "Skipping shell module");
                continue;
            }
            session.modules.push(name.to_ascii_lowercase());
        }

        session.state = LifecycleState::Opened;
        debug!(session = id, modules = session.modules.len(), "Shell session opened");
        session
    }

    fn load_module(&mut self, source: &str, limits: &ScriptLimits) -> Result<(), String> {
        let script = parser::parse(source).map_err(|d| d.to_string())?;
        let mut sink = ResponseSink::new();
        let (variables, functions) = {
            let mut interpreter =
                Interpreter::new(&self.variables, &self.functions, &mut sink, limits);
            match interpreter.run(&script.body) {
                Ok(_) => {}
                Err(Fault::Error(err)) => return Err(err.to_string()),
                Err(Fault::Thrown { message, line }) => {
                    return Err(format!("{message} (line {line})"))
                }
            }
            interpreter.into_definitions()
        };
        self.variables.extend(variables);
        self.functions.extend(functions);
        Ok(())
    }

    /// Session id, unique within the owning manager
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Completed invocations
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    /// Whether a module was preloaded at open
    pub(crate) fn has_module(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.eq_ignore_ascii_case(name))
    }

    pub(crate) fn record_invocation(&mut self) {
        self.invocations += 1;
    }

    pub(crate) fn mark_broken(&mut self) {
        self.state = LifecycleState::Broken;
    }

    pub(crate) fn close(&mut self) {
        if self.state == LifecycleState::Closed {
            return;
        }
        self.state = LifecycleState::Closing;
        self.variables.clear();
        self.functions.clear();
        self.state = LifecycleState::Closed;
        debug!(session = self.id, invocations = self.invocations, "Shell session closed");
    }
}

impl fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("modules", &self.modules)
            .field("invocations", &self.invocations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nautilus_state::GlobalStore;
    use serde_json::json;

    #[test]
    fn test_open_binds_globals_and_modules() {
        let store = GlobalStore::new();
        store.define("Tenant", json!("acme"), false).unwrap();
        let seed = SessionSeed {
            globals: store.snapshot(),
            modules: vec![
                ("greet".to_string(), Arc::from("$greeting = 'hi'\nfunction Get-Greeting($n) { \"$greeting $n\" }")),
                ("broken".to_string(), Arc::from("function {")),
            ],
            host: HostInfo::default(),
            limits: ScriptLimits::default(),
        };

        let mut session = ShellSession::open(3, &seed);
        assert_eq!(session.id(), 3);
        assert_eq!(session.state(), LifecycleState::Opened);
        assert_eq!(session.variables["tenant"], ShellValue::Str("acme".into()));
        assert_eq!(session.variables["host"].member("name"), ShellValue::Str("nautilus".into()));
        assert!(session.functions.contains_key("get-greeting"));
        assert!(session.has_module("GREET"));
        assert!(!session.has_module("broken"));

        session.close();
        assert_eq!(session.state(), LifecycleState::Closed);
        assert!(session.variables.is_empty());
    }
}
