//! Stackform CLI entrypoint.
//!
//! This is the main entrypoint for the stackform command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stackform::cli::{
    Cli, Commands, OutputFormat, OutputFormatter, PlanArgs, StateCommands, VarArgs,
};
use stackform::config::{
    find_settings_file, ConfigValidator, Settings, SettingsParser, StateBackend, SETTINGS_FILE,
};
use stackform::declaration::{DeclarationLoader, Declarations, VariableOverrides};
use stackform::error::{ConfigError, Result, StackformError};
use stackform::planner::{PlanExecutor, PlanMode, Planner};
use stackform::provider::{HttpProvider, Provider};
use stackform::state::{
    with_lock_renewal, LocalStateStore, S3StateStore, StateRecord, StateStore, LOCK_RENEW_SECS,
    STATE_DIR,
};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of `plan` when changes are pending.
const EXIT_CHANGES_PENDING: u8 = 2;

const SETTINGS_TEMPLATE: &str = include_str!("../templates/stackform.yaml");
const SITE_TEMPLATE: &str = include_str!("../templates/declarations/site.yaml");
const ENV_TEMPLATE: &str = include_str!("../templates/.env.example");

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.output);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins unless `--verbose` is given. Logs always go to stderr so
/// stdout stays parseable.
fn init_logging(verbose: bool, format: OutputFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init {
            path,
            force,
            offline,
        } => cmd_init(&path, force, offline).await,
        Commands::Validate { vars } => cmd_validate(config, &vars, &formatter),
        Commands::Plan { destroy, options } => {
            cmd_plan(config, destroy, &options, &formatter).await
        }
        Commands::Apply {
            auto_approve,
            parallelism,
            options,
        } => {
            let ws = Workspace::load(config)?;
            let declarations = ws.validated_declarations(&options.vars)?;
            let request = ApplyRequest {
                mode: PlanMode::Apply,
                declarations,
                refresh: options.refresh,
                auto_approve,
                parallelism,
            };
            run_apply(&ws, request, &formatter).await
        }
        Commands::Destroy {
            auto_approve,
            parallelism,
        } => {
            let ws = Workspace::load(config)?;
            let request = ApplyRequest {
                mode: PlanMode::Destroy,
                declarations: Declarations::default(),
                refresh: false,
                auto_approve,
                parallelism,
            };
            run_apply(&ws, request, &formatter).await
        }
        Commands::Output { name, raw } => cmd_output(config, name.as_deref(), raw, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
async fn cmd_init(path: &Path, force: bool, offline: bool) -> Result<ExitCode> {
    info!("Initializing Stackform project in: {}", path.display());

    let files = [
        (path.join(SETTINGS_FILE), SETTINGS_TEMPLATE),
        (path.join("declarations").join("site.yaml"), SITE_TEMPLATE),
        (path.join(".env.example"), ENV_TEMPLATE),
    ];

    for (file, content) in &files {
        if file.exists() && !force {
            eprintln!("Exists, kept: {} (use --force to overwrite)", file.display());
            continue;
        }
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(file, content)?;
        eprintln!("Created: {}", file.display());
    }
    update_gitignore(&path.join(".gitignore"))?;

    let settings_path = path.join(SETTINGS_FILE);
    let ws = Workspace::load(Some(settings_path.as_path()))?;

    if offline {
        eprintln!("Skipping provider credential check (--offline).");
    } else {
        let provider = ws.provider()?;
        let account = provider.check_auth().await?;
        eprintln!("Authenticated with {} as {account}", ws.settings.provider.endpoint);
    }

    let store = ws.open_store().await?;
    store.prepare().await?;
    let existing = if store.exists().await? { "existing" } else { "empty" };
    eprintln!(
        "State backend ready: {} ({existing}, {})",
        store.backend_type(),
        store.location()
    );

    eprintln!("\nProject initialized. Next steps:");
    eprintln!("  1. Copy .env.example to .env and set STACKFORM_TOKEN");
    eprintln!("  2. Edit declarations/site.yaml");
    eprintln!("  3. Run 'stackform plan' to review changes");
    eprintln!("  4. Run 'stackform apply' to provision them");

    Ok(ExitCode::SUCCESS)
}

/// Appends Stackform entries to `.gitignore`.
fn update_gitignore(path: &Path) -> Result<()> {
    let state_entry = format!("{STATE_DIR}/");
    let entries = [".env", state_entry.as_str()];
    let existing = if path.exists() {
        std::fs::read_to_string(path)?
    } else {
        String::new()
    };

    let missing: Vec<&str> = entries
        .into_iter()
        .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if !existing.is_empty() {
        writeln!(file, "\n# Stackform")?;
    }
    for entry in missing {
        writeln!(file, "{entry}")?;
    }
    eprintln!("Updated: {}", path.display());
    Ok(())
}

/// Validate declarations.
fn cmd_validate(
    config_path: Option<&Path>,
    vars: &VarArgs,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ws = Workspace::load(config_path)?;
    let declarations = ws.declarations(vars)?;
    let result = ConfigValidator::new().check_declarations(&declarations);

    formatter.emit(&formatter.format_validation(&declarations, &result));

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show what apply would change.
async fn cmd_plan(
    config_path: Option<&Path>,
    destroy: bool,
    options: &PlanArgs,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ws = Workspace::load(config_path)?;
    let (mode, declarations) = if destroy {
        (PlanMode::Destroy, Declarations::default())
    } else {
        (PlanMode::Apply, ws.validated_declarations(&options.vars)?)
    };

    let store = ws.open_store().await?;
    let state = ws.state(&*store).await?;

    let plan = Planner::new(ws.provider()?)
        .with_retry(ws.settings.apply.retry.clone())
        .with_refresh(options.refresh)
        .with_mode(mode)
        .plan(&declarations, &state)
        .await?;

    formatter.emit(&formatter.format_plan(&plan));

    Ok(if plan.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_CHANGES_PENDING)
    })
}

/// Inputs to an apply or destroy run.
struct ApplyRequest {
    mode: PlanMode,
    declarations: Declarations,
    refresh: bool,
    auto_approve: bool,
    parallelism: Option<u32>,
}

impl ApplyRequest {
    const fn operation(&self) -> &'static str {
        match self.mode {
            PlanMode::Apply => "apply",
            PlanMode::Destroy => "destroy",
        }
    }
}

/// Plans and executes under the state lock.
async fn run_apply(
    ws: &Workspace,
    request: ApplyRequest,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let store = ws.open_store().await?;
    let provider = ws.provider()?;

    let lock = store.acquire_lock("", request.operation()).await?;
    debug!("Acquired state lock {}", lock.lock_id);

    let outcome = with_lock_renewal(
        &*store,
        &lock,
        Duration::from_secs(LOCK_RENEW_SECS),
        apply_locked(ws, &*store, provider, &request, &lock.lock_id, formatter),
    )
    .await;

    if let Err(e) = store.release_lock(&lock.lock_id).await {
        warn!("Failed to release state lock {}: {e}", lock.lock_id);
    }
    outcome
}

async fn apply_locked(
    ws: &Workspace,
    store: &dyn StateStore,
    provider: Arc<dyn Provider>,
    request: &ApplyRequest,
    lock_id: &str,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let retry = ws.settings.apply.retry.clone();
    let state = ws.state(store).await?;

    if request.mode == PlanMode::Destroy && state.is_empty() {
        eprintln!("Nothing to destroy.");
        return Ok(ExitCode::SUCCESS);
    }

    let plan = Planner::new(Arc::clone(&provider))
        .with_retry(retry.clone())
        .with_refresh(request.refresh)
        .with_mode(request.mode)
        .plan(&request.declarations, &state)
        .await?;

    formatter.emit(&formatter.format_plan(&plan));

    if !plan.is_empty() && !request.auto_approve && !confirm(request.operation()).await? {
        eprintln!("{} cancelled.", capitalize(request.operation()));
        return Ok(ExitCode::FAILURE);
    }

    let parallelism = match request.parallelism {
        Some(n) => usize::try_from(n).map_err(|_| {
            ConfigError::validation(format!("parallelism {n} is out of range"), "parallelism")
        })?,
        None => ws.settings.apply.parallelism,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, waiting for in-flight steps");
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };

    let result = PlanExecutor::new(provider, store)
        .with_retry(retry)
        .with_parallelism(parallelism)
        .with_cancel_flag(cancel)
        .with_lock(lock_id)
        .execute(&plan, state)
        .await;
    watcher.abort();
    let result = result?;

    if !plan.is_empty() {
        formatter.emit(&formatter.format_execution(&result));
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// The review gate: only a literal `yes` proceeds.
///
/// Reads on a blocking thread so the lock keeps being renewed while the
/// prompt waits.
async fn confirm(operation: &'static str) -> Result<bool> {
    tokio::task::spawn_blocking(move || read_confirmation(operation))
        .await
        .map_err(|e| StackformError::internal(format!("Review prompt failed: {e}")))?
}

fn read_confirmation(operation: &str) -> Result<bool> {
    eprintln!("\nDo you want to {operation} these changes? Only 'yes' will be accepted.");
    eprint!("  Enter a value: ");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim() == "yes")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Show outputs.
async fn cmd_output(
    config_path: Option<&Path>,
    name: Option<&str>,
    raw: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ws = Workspace::load(config_path)?;
    let store = ws.open_store().await?;
    let state = ws.state(&*store).await?;

    match name {
        Some(name) => {
            let value = state.outputs.get(name).ok_or_else(|| {
                ConfigError::validation(format!("No output named '{name}' is recorded"), "name")
            })?;
            formatter.emit(&formatter.format_output_value(value, raw));
        }
        None => formatter.emit(&formatter.format_outputs(&state.outputs)),
    }

    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let ws = Workspace::load(config_path)?;
    let store = ws.open_store().await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                formatter.emit(&formatter.format_state(&state));
            } else {
                eprintln!("No state found at {}.", store.location());
            }
            if let Some(lock_info) = store.get_lock_info().await? {
                formatter.warning(&format!("Lock {lock_info}"));
            }
        }
        StateCommands::List => {
            let state = ws.state(&*store).await?;
            formatter.emit(&formatter.format_resource_list(&state));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    formatter.success(&format!("Released lock {lock_info}."));
                } else {
                    formatter.warning("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                formatter.success("State unlocked.");
            } else {
                return Err(
                    ConfigError::validation("Provide --lock-id or use --force", "lock_id").into(),
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded settings and the directory they are relative to.
struct Workspace {
    settings: Settings,
    root: PathBuf,
}

impl Workspace {
    /// Loads `.env`, the settings file and environment overrides.
    fn load(config_path: Option<&Path>) -> Result<Self> {
        let settings_file = resolve_settings_path(config_path)?;
        debug!("Loading settings from: {}", settings_file.display());

        let root = settings_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let parser = SettingsParser::new().with_base_path(root.clone());
        parser.load_dotenv()?;
        let settings = parser.load_with_env(&settings_file)?;

        let result = ConfigValidator::new().validate_settings(&settings)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        Ok(Self { settings, root })
    }

    /// Loads declarations with variable overrides applied.
    ///
    /// Precedence, lowest first: defaults, the variable file, `STACKFORM_VAR_*`,
    /// then `--var`.
    fn declarations(&self, vars: &VarArgs) -> Result<Declarations> {
        let var_file = vars.var_file.clone().or_else(|| {
            let path = self.root.join(&self.settings.var_file);
            path.exists().then_some(path)
        });

        let mut overrides = VariableOverrides::new();
        if let Some(path) = var_file {
            overrides = overrides.with_file(path)?;
        }
        overrides = overrides.with_process_env();
        for assignment in &vars.vars {
            overrides = overrides.with_assignment(assignment)?;
        }

        let paths: Vec<PathBuf> = self
            .settings
            .declarations
            .iter()
            .map(|d| self.root.join(d))
            .collect();

        DeclarationLoader::new()
            .with_overrides(overrides)
            .load_paths(&paths)
    }

    /// Loads declarations and rejects any catalog violation.
    fn validated_declarations(&self, vars: &VarArgs) -> Result<Declarations> {
        let declarations = self.declarations(vars)?;
        let result = ConfigValidator::new().validate_declarations(&declarations)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }
        Ok(declarations)
    }

    /// Creates the state store the settings select.
    async fn open_store(&self) -> Result<Box<dyn StateStore>> {
        let state = &self.settings.state;
        let store: Box<dyn StateStore> = match state.backend {
            StateBackend::Local => match &state.path {
                Some(path) => Box::new(LocalStateStore::with_state_path(self.root.join(path))),
                None => Box::new(LocalStateStore::with_base_dir(self.root.join(STATE_DIR))),
            },
            StateBackend::S3 => {
                let bucket = state.bucket.as_deref().ok_or_else(|| {
                    ConfigError::validation(
                        "S3 bucket name is required when using S3 backend",
                        "state.bucket",
                    )
                })?;
                Box::new(
                    S3StateStore::new(bucket, state.prefix.as_deref(), state.region.as_deref())
                        .await?,
                )
            }
        };
        debug!("Using {} state at {}", store.backend_type(), store.location());
        Ok(store)
    }

    /// Loads the State Record, or starts an empty one.
    async fn state(&self, store: &dyn StateStore) -> Result<StateRecord> {
        Ok(store.load().await?.unwrap_or_else(|| {
            StateRecord::new(&self.settings.project.name, &self.settings.project.environment)
        }))
    }

    /// Creates the HTTP provider with the resolved token.
    fn provider(&self) -> Result<Arc<dyn Provider>> {
        let token = SettingsParser::resolve_token()?;
        let provider = HttpProvider::with_timeout(
            &self.settings.provider.endpoint,
            &token,
            self.settings.provider.timeout_secs,
        )?
        .with_region(self.settings.provider.region.clone());
        Ok(Arc::new(provider))
    }
}

/// Resolves the settings file path.
fn resolve_settings_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_settings_file("."), |path| Ok(path.to_path_buf()))
}
