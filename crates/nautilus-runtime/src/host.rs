//! Script host: owns the compiler, router, auth registry and global store

use crate::error::{HostError, Result};
use http::Method;
use nautilus_auth::{AuthPolicy, AuthRegistry, AuthScheme};
use nautilus_config::{Config, EngineConfig, RouteConfig, ScriptSource};
use nautilus_core::{Binding, BindingTable, DuplicatePolicy, Error, ValueKind};
use nautilus_router::{PathPattern, Route, RouteFlags, Router};
use nautilus_scripting::{
    CompilationRequest, CompiledHandler, CompilerOptions, ContextBridge, HostInfo, ModuleCatalog,
    ResultKind, ScriptCompiler, ScriptLanguage, ScriptLimits, SessionPoolConfig,
};
use nautilus_state::GlobalStore;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default request body limit (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Host-wide settings
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// What to do when a (pattern, method) pair is registered twice
    pub duplicate_policy: DuplicatePolicy,
    /// Largest accepted request body in bytes
    pub max_body_size: usize,
    /// Execution limits for every handler
    pub limits: ScriptLimits,
    /// Shell session pool configuration
    pub session_pool: SessionPoolConfig,
    /// Host name exposed to scripts
    pub host_name: String,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            limits: ScriptLimits::default(),
            session_pool: SessionPoolConfig::default(),
            host_name: HostInfo::default().name,
        }
    }
}

impl From<&EngineConfig> for HostOptions {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            duplicate_policy: engine.duplicate_policy,
            max_body_size: engine.max_body_size,
            limits: engine.limits.clone(),
            session_pool: engine.session_pool.clone(),
            host_name: engine.host_name.clone(),
        }
    }
}

/// Registration lifecycle, traced at debug level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Request received
    Requested,
    /// Validation passed, source is compiling
    Compiling,
    /// Route is live
    Registered,
    /// Duplicate under the reject policy
    Rejected,
    /// Validation, compilation or duplicate error
    Failed,
}

impl RegistrationState {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Requested => "requested",
            RegistrationState::Compiling => "compiling",
            RegistrationState::Registered => "registered",
            RegistrationState::Rejected => "rejected",
            RegistrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A script route to register
#[derive(Debug, Clone)]
pub struct RouteRegistration {
    /// Path pattern (e.g., "/users/:id")
    pub pattern: String,
    /// HTTP methods; empty means GET
    pub methods: Vec<String>,
    /// Source language
    pub language: ScriptLanguage,
    /// Script body
    pub source: String,
    /// Handler name; defaults to "METHODS pattern"
    pub name: Option<String>,
    /// Library modules to import
    pub imports: Vec<String>,
    /// Library files merged in at compile time
    pub references: Vec<PathBuf>,
    /// Typed locals bound on every invocation
    pub locals: BindingTable,
    /// Lines preceding the script in its origin document
    pub line_offset: usize,
    /// Schemes tried in order to authenticate the caller
    pub auth_schemes: Vec<String>,
    /// Policies the caller must satisfy
    pub auth_policies: Vec<String>,
    /// Transport flags
    pub flags: RouteFlags,
    /// Priority (higher = matched first)
    pub priority: i32,
    /// Duplicate handling for this registration; the host policy when `None`
    pub duplicate_policy: Option<DuplicatePolicy>,
    /// Route metadata
    pub metadata: HashMap<String, String>,
}

impl RouteRegistration {
    /// Start a registration for a pattern and script
    pub fn new(
        pattern: impl Into<String>,
        language: ScriptLanguage,
        source: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            methods: Vec::new(),
            language,
            source: source.into(),
            name: None,
            imports: Vec::new(),
            references: Vec::new(),
            locals: BindingTable::new(),
            line_offset: 0,
            auth_schemes: Vec::new(),
            auth_policies: Vec::new(),
            flags: RouteFlags::default(),
            priority: 0,
            duplicate_policy: None,
            metadata: HashMap::new(),
        }
    }

    /// Add a method
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    /// Add several methods
    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(methods.into_iter().map(Into::into));
        self
    }

    /// Set the handler name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Import a library module
    pub fn import(mut self, module: impl Into<String>) -> Self {
        self.imports.push(module.into());
        self
    }

    /// Reference a library file
    pub fn reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.references.push(path.into());
        self
    }

    /// Bind a local, inferring its kind
    pub fn local(mut self, name: impl Into<String>, value: Value) -> Self {
        self.locals.insert(Binding::new(name, value));
        self
    }

    /// Bind a local with an explicit kind
    pub fn typed_local(mut self, name: impl Into<String>, value: Value, kind: ValueKind) -> Self {
        self.locals.insert(Binding::typed(name, value, kind));
        self
    }

    /// Set the line offset reported in diagnostics
    pub fn line_offset(mut self, offset: usize) -> Self {
        self.line_offset = offset;
        self
    }

    /// Require an authentication scheme
    pub fn auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_schemes.push(scheme.into());
        self
    }

    /// Require an authorization policy
    pub fn auth_policy(mut self, policy: impl Into<String>) -> Self {
        self.auth_policies.push(policy.into());
        self
    }

    /// Set transport flags
    pub fn flags(mut self, flags: RouteFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the host duplicate policy for this registration
    pub fn duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = Some(policy);
        self
    }

    /// Add metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn parsed_methods(&self) -> Result<Vec<Method>> {
        if self.methods.is_empty() {
            return Ok(vec![Method::GET]);
        }

        let mut methods: Vec<Method> = Vec::with_capacity(self.methods.len());
        for verb in &self.methods {
            let method = Method::from_bytes(verb.trim().to_uppercase().as_bytes())
                .map_err(|_| Error::validation(format!("invalid HTTP method '{verb}'")))?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        Ok(methods)
    }

    fn validate(&self) -> Result<(Vec<Method>, PathPattern)> {
        if self.pattern.is_empty() {
            return Err(Error::validation("route pattern cannot be empty").into());
        }
        if !self.pattern.starts_with('/') {
            return Err(Error::validation(format!(
                "route pattern '{}' must start with '/'",
                self.pattern
            ))
            .into());
        }
        if self.source.trim().is_empty() {
            return Err(Error::validation(format!(
                "route '{}' has empty source",
                self.pattern
            ))
            .into());
        }

        let methods = self.parsed_methods()?;
        let pattern = PathPattern::parse(&self.pattern)?;
        Ok((methods, pattern))
    }
}

/// Routes created by one successful registration
#[derive(Debug, Clone)]
pub struct RouteHandle {
    /// One route per method, sharing a handler
    pub routes: Vec<Arc<Route>>,
    /// The compiled handler
    pub handler: CompiledHandler,
}

impl RouteHandle {
    /// Methods this registration serves
    pub fn methods(&self) -> Vec<Method> {
        self.routes.iter().map(|r| r.method.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Delegate {
    Validator,
    ClaimIssuer,
}

impl Delegate {
    fn result_kind(self) -> ResultKind {
        match self {
            Delegate::Validator => ResultKind::Verdict,
            Delegate::ClaimIssuer => ResultKind::Claims,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Delegate::Validator => "validator",
            Delegate::ClaimIssuer => "claim issuer",
        }
    }
}

pub(crate) struct HostInner {
    pub(crate) compiler: ScriptCompiler,
    pub(crate) router: Router,
    pub(crate) auth: AuthRegistry,
    pub(crate) bridge: ContextBridge,
    pub(crate) globals: GlobalStore,
    pub(crate) options: HostOptions,
}

/// Registers script handlers and serves requests against them
///
/// Cloning is cheap; clones share every registry.
#[derive(Clone)]
pub struct ScriptHost {
    pub(crate) inner: Arc<HostInner>,
}

impl fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHost")
            .field("routes", &self.inner.router.len())
            .field("schemes", &self.inner.auth.scheme_names())
            .field("globals", &self.inner.globals.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new(HostOptions::default())
    }
}

impl ScriptHost {
    /// Create a host with an empty store and module catalog
    pub fn new(options: HostOptions) -> Self {
        Self::with_store(GlobalStore::new(), ModuleCatalog::new(), options)
    }

    /// Create a host over an existing store and module catalog
    pub fn with_store(globals: GlobalStore, modules: ModuleCatalog, options: HostOptions) -> Self {
        let compiler = ScriptCompiler::new(
            globals.clone(),
            modules,
            CompilerOptions {
                limits: options.limits.clone(),
                pool: options.session_pool.clone(),
                host: HostInfo {
                    name: options.host_name.clone(),
                    ..HostInfo::default()
                },
            },
        );

        Self {
            inner: Arc::new(HostInner {
                compiler,
                router: Router::new(),
                auth: AuthRegistry::new(),
                bridge: ContextBridge::new(globals.clone()),
                globals,
                options,
            }),
        }
    }

    /// Build a host from configuration
    ///
    /// Globals, modules, schemes (with their delegates), policies and routes
    /// are registered in that order. Script files are read here.
    pub async fn from_config(config: Config) -> Result<Self> {
        nautilus_config::validate_config(&config)?;
        let host = Self::new(HostOptions::from(&config.engine));

        for global in config.globals {
            match global.kind {
                Some(kind) => {
                    host.globals()
                        .define_typed(&global.name, global.value, kind, global.read_only)?
                }
                None => host
                    .globals()
                    .define(&global.name, global.value, global.read_only)?,
            }
        }

        for module in config.modules {
            let source = read_source(&module.script).await?;
            host.modules()
                .register(module.script.language, &module.name, source);
        }

        for scheme in config.schemes {
            let mut auth_scheme = AuthScheme::new(scheme.name.clone(), scheme.kind);
            if let Some(realm) = scheme.realm {
                auth_scheme = auth_scheme.with_realm(realm);
            }
            host.register_scheme(auth_scheme)?;

            if let Some(script) = scheme.validator {
                let request = script_request(&script).await?;
                host.attach_delegate(&scheme.name, Delegate::Validator, request)
                    .await?;
            }
            if let Some(script) = scheme.claim_issuer {
                let request = script_request(&script).await?;
                host.attach_delegate(&scheme.name, Delegate::ClaimIssuer, request)
                    .await?;
            }
        }

        for policy in config.policies {
            host.register_policy(policy)?;
        }

        for route in config.routes {
            let pattern = route.pattern.clone();
            let registration = route_registration(route).await?;
            if host.register(registration).await?.is_none() {
                warn!(pattern = %pattern, "Duplicate route in configuration skipped");
            }
        }

        info!(
            routes = host.router().len(),
            schemes = host.auth().scheme_names().len(),
            globals = host.globals().len(),
            "Script host configured"
        );
        Ok(host)
    }

    /// Register a script route
    ///
    /// Returns `Ok(None)` when the pattern is already registered for one of
    /// the methods and the duplicate policy is [`DuplicatePolicy::Reject`].
    /// Existing routes are never overwritten.
    pub async fn register(&self, registration: RouteRegistration) -> Result<Option<RouteHandle>> {
        let label = format!(
            "{} {}",
            if registration.methods.is_empty() {
                "GET".to_string()
            } else {
                registration.methods.join(",").to_uppercase()
            },
            registration.pattern
        );
        trace_state(&label, RegistrationState::Requested);
        let policy = registration
            .duplicate_policy
            .unwrap_or(self.inner.options.duplicate_policy);

        let checked = registration.validate().and_then(|validated| {
            self.inner
                .auth
                .check_references(&registration.auth_schemes, &registration.auth_policies)?;
            Ok(validated)
        });
        let (methods, pattern) = match checked {
            Ok(checked) => checked,
            Err(err) => {
                trace_state(&label, RegistrationState::Failed);
                return Err(err);
            }
        };

        if let Some(method) = methods
            .iter()
            .find(|method| self.inner.router.contains(method, &pattern))
        {
            return duplicate(policy, &label, method, &pattern);
        }

        trace_state(&label, RegistrationState::Compiling);
        let mut request = CompilationRequest::new(registration.language, registration.source)
            .name(registration.name.clone().unwrap_or_else(|| label.clone()))
            .imports(registration.imports)
            .locals(registration.locals.clone())
            .line_offset(registration.line_offset);
        for reference in registration.references {
            request = request.reference(reference);
        }

        let handler = match self.inner.compiler.compile(request).await {
            Ok(handler) => handler,
            Err(err) => {
                trace_state(&label, RegistrationState::Failed);
                return Err(err.into());
            }
        };

        let mut routes: Vec<Arc<Route>> = Vec::with_capacity(methods.len());
        for method in &methods {
            let mut builder = Route::builder()
                .method(method.clone())
                .path(registration.pattern.clone())
                .handler(handler.clone())
                .locals(registration.locals.clone())
                .flags(registration.flags.clone())
                .priority(registration.priority);
            for scheme in &registration.auth_schemes {
                builder = builder.auth_scheme(scheme.clone());
            }
            for policy in &registration.auth_policies {
                builder = builder.auth_policy(policy.clone());
            }
            for (key, value) in &registration.metadata {
                builder = builder.metadata(key.clone(), value.clone());
            }

            let inserted = builder
                .build()
                .and_then(|route| self.inner.router.add_route(route));
            match inserted {
                Ok(route) => routes.push(route),
                Err(err) => {
                    self.roll_back(&routes);
                    if matches!(err, Error::DuplicateRoute { .. }) {
                        return duplicate(policy, &label, method, &pattern);
                    }
                    trace_state(&label, RegistrationState::Failed);
                    return Err(err.into());
                }
            }
        }

        trace_state(&label, RegistrationState::Registered);
        info!(route = %label, language = %handler.language(), "Route registered");
        Ok(Some(RouteHandle { routes, handler }))
    }

    fn roll_back(&self, routes: &[Arc<Route>]) {
        for route in routes {
            if let Err(err) = self.inner.router.remove_route(&route.method, route.path()) {
                warn!(method = %route.method, path = %route.path(), error = %err, "Rollback failed");
            }
        }
    }

    /// Remove a route
    pub fn unregister(&self, method: &Method, pattern: &str) -> Result<Arc<Route>> {
        Ok(self.inner.router.remove_route(method, pattern)?)
    }

    /// Register an authentication scheme
    pub fn register_scheme(&self, scheme: AuthScheme) -> Result<()> {
        Ok(self.inner.auth.register_scheme(scheme)?)
    }

    /// Register an authorization policy
    pub fn register_policy(&self, policy: AuthPolicy) -> Result<()> {
        Ok(self.inner.auth.register_policy(policy)?)
    }

    /// Compile a credential validator and attach it to a scheme
    ///
    /// The script sees the scheme's credentials as locals (`username` and
    /// `password`, `key`, or `token`) and must produce a boolean.
    pub async fn register_validator(
        &self,
        scheme: &str,
        language: ScriptLanguage,
        source: impl Into<String>,
    ) -> Result<CompiledHandler> {
        self.attach_delegate(
            scheme,
            Delegate::Validator,
            CompilationRequest::new(language, source),
        )
        .await
    }

    /// Compile a claim issuer and attach it to a scheme
    ///
    /// The script sees the credential locals plus `identity_name` and must
    /// produce a list of claims.
    pub async fn register_claim_issuer(
        &self,
        scheme: &str,
        language: ScriptLanguage,
        source: impl Into<String>,
    ) -> Result<CompiledHandler> {
        self.attach_delegate(
            scheme,
            Delegate::ClaimIssuer,
            CompilationRequest::new(language, source),
        )
        .await
    }

    async fn attach_delegate(
        &self,
        scheme: &str,
        delegate: Delegate,
        request: CompilationRequest,
    ) -> Result<CompiledHandler> {
        let kind = self
            .inner
            .auth
            .scheme(scheme)
            .map(|s| s.kind)
            .ok_or_else(|| Error::UnknownScheme(scheme.to_string()))?;

        let locals = match delegate {
            Delegate::Validator => kind.credential_locals(),
            Delegate::ClaimIssuer => kind.claim_issuer_locals(),
        };
        let request = CompilationRequest {
            name: format!("{scheme} {}", delegate.label()),
            locals: request.locals.merged(&locals),
            result_kind: delegate.result_kind(),
            ..request
        };

        let handler = self.inner.compiler.compile(request).await?;
        match delegate {
            Delegate::Validator => self.inner.auth.attach_validator(scheme, handler.clone())?,
            Delegate::ClaimIssuer => self
                .inner
                .auth
                .attach_claim_issuer(scheme, handler.clone())?,
        }
        debug!(scheme = %scheme, delegate = delegate.label(), "Auth delegate registered");
        Ok(handler)
    }

    /// Shared global store
    pub fn globals(&self) -> &GlobalStore {
        &self.inner.globals
    }

    /// Library module catalog
    pub fn modules(&self) -> &ModuleCatalog {
        self.inner.compiler.modules()
    }

    /// Route table
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Scheme and policy registry
    pub fn auth(&self) -> &AuthRegistry {
        &self.inner.auth
    }

    /// Script compiler
    pub fn compiler(&self) -> &ScriptCompiler {
        &self.inner.compiler
    }

    /// Host options
    pub fn options(&self) -> &HostOptions {
        &self.inner.options
    }

    /// Close the shell session pool
    pub async fn shutdown(&self) {
        self.inner.compiler.shutdown().await;
        info!("Script host shut down");
    }
}

fn trace_state(route: &str, state: RegistrationState) {
    debug!(route = %route, state = %state, "Registration state changed");
}

async fn read_source(script: &ScriptSource) -> Result<String> {
    match (&script.source, &script.file) {
        (Some(source), _) => Ok(source.clone()),
        (None, Some(path)) => tokio::fs::read_to_string(path)
            .await
            .map_err(|source| HostError::Io {
                path: path.display().to_string(),
                source,
            }),
        (None, None) => Err(HostError::Config(
            "script needs either source or file".to_string(),
        )),
    }
}

async fn script_request(script: &ScriptSource) -> Result<CompilationRequest> {
    let source = read_source(script).await?;
    let mut request = CompilationRequest::new(script.language, source)
        .imports(script.imports.iter().cloned())
        .line_offset(script.line_offset);
    for reference in &script.references {
        request = request.reference(reference.clone());
    }
    Ok(request)
}

fn duplicate(
    policy: DuplicatePolicy,
    label: &str,
    method: &Method,
    pattern: &PathPattern,
) -> Result<Option<RouteHandle>> {
    match policy {
        DuplicatePolicy::Reject => {
            trace_state(label, RegistrationState::Rejected);
            Ok(None)
        }
        DuplicatePolicy::Error => {
            trace_state(label, RegistrationState::Failed);
            Err(Error::DuplicateRoute {
                pattern: pattern.as_str().to_string(),
                method: method.to_string(),
            }
            .into())
        }
    }
}

async fn route_registration(route: RouteConfig) -> Result<RouteRegistration> {
    let source = read_source(&route.script).await?;
    let locals: BTreeMap<String, Value> = route.locals.into_iter().collect();

    let mut registration = RouteRegistration::new(route.pattern, route.script.language, source)
        .methods(route.methods)
        .line_offset(route.script.line_offset)
        .flags(RouteFlags {
            short_circuit: route.short_circuit,
            cors: route.cors,
            rate_limit_policy: route.rate_limit_policy,
        })
        .priority(route.priority);
    registration.name = route.name;
    registration.imports = route.script.imports;
    registration.references = route.script.references;
    registration.locals = BindingTable::from_values(locals);
    registration.auth_schemes = route.auth_schemes;
    registration.auth_policies = route.auth_policies;
    registration.duplicate_policy = route.duplicate_policy;
    registration.metadata = route.metadata;
    Ok(registration)
}
