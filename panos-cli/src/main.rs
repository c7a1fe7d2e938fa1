mod config;
mod device;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;

use panos_core::differ::diff_group;
use panos_core::identity::CompositeIdentity;
use panos_core::movement::MovementDirective;
use panos_core::plan::{Effect, Plan};
use panos_core::provider::{OrderedListGateway, SettingsGateway};
use panos_core::reconciler::{GroupError, GroupReconciler, Rehydration, decode_identity};
use panos_core::resource::ResourceId;
use panos_core::rule::BgpExportRule;
use panos_core::scope::{Scope, Target};
use panos_core::settings::{merge_then_edit, plan_settings};
use panos_state::{ResourceState, StateBackend, StateFile, create_backend};

use config::{Config, GROUP_RESOURCE_TYPE, GroupConfig, SettingsConfig};
use device::FileDevice;

#[derive(Parser)]
#[command(name = "panos")]
#[command(about = "Keep ordered PAN-OS rule groups and settings in their declared shape", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, global = true, default_value = "panos.json")]
    config: PathBuf,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Show execution plan without applying changes
    Plan,
    /// Apply changes to reach the desired state
    Apply,
    /// Re-read managed groups and report drift
    Refresh,
    /// Delete every rule group recorded in state
    Destroy {
        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Encode or inspect rule group identifiers
    Id {
        #[command(subcommand)]
        command: IdCommands,
    },
    /// Release a state lock left behind by an interrupted run
    ForceUnlock {
        lock_id: String,
    },
}

#[derive(Subcommand)]
enum IdCommands {
    /// Print the identifier of a rule group
    Encode {
        #[arg(long, default_value = "")]
        template: String,
        #[arg(long, default_value = "")]
        template_stack: String,
        #[arg(long)]
        virtual_router: String,
        #[arg(long, default_value = "")]
        position_keyword: String,
        #[arg(long, default_value = "")]
        position_reference: String,
        /// Rule names in group order
        #[arg(required = true)]
        rules: Vec<String>,
    },
    /// Show what an identifier refers to
    Decode { id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Validate => run_validate(&cli.config),
        Commands::Plan => run_plan(&cli.config).await,
        Commands::Apply => run_apply(&cli.config).await,
        Commands::Refresh => run_refresh(&cli.config).await,
        Commands::Destroy { auto_approve } => run_destroy(&cli.config, auto_approve).await,
        Commands::Id { command } => run_id_command(command),
        Commands::ForceUnlock { lock_id } => run_force_unlock(&cli.config, &lock_id).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn load_config(path: &Path) -> Result<Config, String> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

fn run_validate(file: &Path) -> Result<(), String> {
    println!("{}", "Validating...".cyan());
    let config = load_config(file)?;

    println!(
        "{}",
        format!(
            "✓ {} resources validated successfully.",
            config.resource_count()
        )
        .green()
        .bold()
    );
    for group in &config.bgp_export_rule_groups {
        println!("  • {} ({} rules)", group.resource_id(), group.rules.len());
    }
    for settings in &config.settings {
        println!("  • {}", settings.resource_id());
    }
    Ok(())
}

async fn run_plan(file: &Path) -> Result<(), String> {
    let config = load_config(file)?;
    let device = FileDevice::open(&config.device)?;
    let backend = create_backend(&config.backend_config()).map_err(|e| e.to_string())?;
    let state = read_state(backend.as_ref()).await?;

    let plan = build_plan(&config, &device, &state).await?;
    print_plan(&plan);
    Ok(())
}

async fn run_apply(file: &Path) -> Result<(), String> {
    let config = load_config(file)?;
    let device = FileDevice::open(&config.device)?;
    let backend = create_backend(&config.backend_config()).map_err(|e| e.to_string())?;

    let lock = backend
        .acquire_lock("apply")
        .await
        .map_err(|e| e.to_string())?;
    let result = apply_locked(&config, &device, backend.as_ref()).await;
    let released = backend.release_lock(&lock).await;

    result?;
    released.map_err(|e| format!("Failed to release lock {}: {}", lock.id, e))
}

async fn apply_locked(
    config: &Config,
    device: &FileDevice,
    backend: &dyn StateBackend,
) -> Result<(), String> {
    let mut state = read_state(backend).await?;
    let plan = build_plan(config, device, &state).await?;
    let forgotten = forget_undeclared_settings(config, &mut state);

    if plan.is_empty() {
        if forgotten > 0 {
            write_state(backend, &mut state).await?;
        }
        println!("{}", "No changes needed.".green());
        return Ok(());
    }

    print_plan(&plan);
    println!();
    println!("{}", "Applying changes...".cyan().bold());
    println!();

    let (success_count, failure_count) = apply_plan(config, device, &plan, &mut state).await;

    write_state(backend, &mut state).await?;

    println!();
    if failure_count == 0 {
        println!(
            "{}",
            format!("Apply complete! {} changes applied.", success_count)
                .green()
                .bold()
        );
        Ok(())
    } else {
        println!(
            "{}",
            format!(
                "Apply failed. {} succeeded, {} failed.",
                success_count, failure_count
            )
            .red()
            .bold()
        );
        Err(format!("{} change(s) failed", failure_count))
    }
}

async fn run_refresh(file: &Path) -> Result<(), String> {
    let config = load_config(file)?;
    let device = FileDevice::open(&config.device)?;
    let backend = create_backend(&config.backend_config()).map_err(|e| e.to_string())?;

    let lock = backend
        .acquire_lock("refresh")
        .await
        .map_err(|e| e.to_string())?;
    let result = refresh_locked(&device, backend.as_ref()).await;
    let released = backend.release_lock(&lock).await;

    result?;
    released.map_err(|e| format!("Failed to release lock {}: {}", lock.id, e))
}

async fn refresh_locked(device: &FileDevice, backend: &dyn StateBackend) -> Result<(), String> {
    let mut state = read_state(backend).await?;
    let report = refresh_state(device, &mut state).await?;

    for name in &report.vanished {
        println!(
            "  {} {}.{} no longer exists on the device and was removed from state",
            "!".yellow().bold(),
            GROUP_RESOURCE_TYPE,
            name
        );
    }
    for (name, drift) in &report.drifted {
        println!(
            "  {} {}.{}: {}",
            "~".yellow().bold(),
            GROUP_RESOURCE_TYPE,
            name,
            drift
        );
    }

    write_state(backend, &mut state).await?;

    if report.is_clean() {
        println!("{}", "All managed groups are in place.".green());
    } else {
        println!();
        println!(
            "{}",
            "Run 'panos apply' to restore the declared groups.".yellow()
        );
    }
    Ok(())
}

async fn run_destroy(file: &Path, auto_approve: bool) -> Result<(), String> {
    let config = load_config(file)?;
    let device = FileDevice::open(&config.device)?;
    let backend = create_backend(&config.backend_config()).map_err(|e| e.to_string())?;

    let lock = backend
        .acquire_lock("destroy")
        .await
        .map_err(|e| e.to_string())?;
    let result = destroy_locked(&device, backend.as_ref(), auto_approve).await;
    let released = backend.release_lock(&lock).await;

    result?;
    released.map_err(|e| format!("Failed to release lock {}: {}", lock.id, e))
}

async fn destroy_locked(
    device: &FileDevice,
    backend: &dyn StateBackend,
    auto_approve: bool,
) -> Result<(), String> {
    let mut state = read_state(backend).await?;
    let groups: Vec<String> = state
        .resources_of(GROUP_RESOURCE_TYPE)
        .map(|r| r.name.clone())
        .collect();

    if groups.is_empty() {
        println!("{}", "No resources to destroy.".green());
        return Ok(());
    }

    println!("{}", "Destroy Plan:".red().bold());
    println!();
    for name in &groups {
        println!("  {} {}.{}", "-".red().bold(), GROUP_RESOURCE_TYPE, name);
    }
    println!();
    println!("Plan: {} to destroy.", groups.len().to_string().red());
    println!();

    if !auto_approve && !confirm_destroy()? {
        println!();
        println!("{}", "Destroy cancelled.".yellow());
        return Ok(());
    }

    println!("{}", "Destroying resources...".red().bold());
    println!();

    let (success_count, failure_count) = destroy_groups(device, &mut state).await;

    write_state(backend, &mut state).await?;

    println!();
    if failure_count == 0 {
        println!(
            "{}",
            format!("Destroy complete! {} resources destroyed.", success_count)
                .green()
                .bold()
        );
        Ok(())
    } else {
        println!(
            "{}",
            format!(
                "Destroy failed. {} succeeded, {} failed.",
                success_count, failure_count
            )
            .red()
            .bold()
        );
        Err(format!("{} group(s) could not be destroyed", failure_count))
    }
}

fn confirm_destroy() -> Result<bool, String> {
    println!(
        "{}",
        "Do you really want to destroy all managed rule groups?"
            .yellow()
            .bold()
    );
    println!(
        "  {}",
        "This action cannot be undone. Type 'yes' to confirm.".yellow()
    );
    print!("\n  Enter a value: ");
    std::io::Write::flush(&mut std::io::stdout()).map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;
    println!();
    Ok(input.trim() == "yes")
}

fn run_id_command(command: IdCommands) -> Result<(), String> {
    match command {
        IdCommands::Encode {
            template,
            template_stack,
            virtual_router,
            position_keyword,
            position_reference,
            rules,
        } => {
            let scope = Scope::new(
                Target::from_fields(&template, &template_stack),
                virtual_router,
            );
            let directive = position_keyword
                .parse::<MovementDirective>()
                .map_err(|e| e.to_string())?;
            let identity = CompositeIdentity::new(scope, directive, position_reference, rules)
                .map_err(|e| e.to_string())?;
            println!("{}", identity.encode());
            Ok(())
        }
        IdCommands::Decode { id } => {
            let identity = decode_identity(&id).map_err(|e| e.to_string())?;
            print_identity(&identity);
            Ok(())
        }
    }
}

async fn run_force_unlock(file: &Path, lock_id: &str) -> Result<(), String> {
    let config = Config::load(file)?;
    let backend = create_backend(&config.backend_config()).map_err(|e| e.to_string())?;
    backend
        .force_unlock(lock_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", format!("Lock {} released.", lock_id).green());
    Ok(())
}

async fn read_state(backend: &dyn StateBackend) -> Result<StateFile, String> {
    Ok(backend
        .read_state()
        .await
        .map_err(|e| format!("Failed to read state: {}", e))?
        .unwrap_or_default())
}

async fn write_state(backend: &dyn StateBackend, state: &mut StateFile) -> Result<(), String> {
    state.increment_serial();
    backend
        .write_state(state)
        .await
        .map_err(|e| format!("Failed to write state: {}", e))
}

/// Identity stored for a group by the last successful apply
fn previous_identity(state: &StateFile, name: &str) -> Result<Option<CompositeIdentity>, String> {
    match state
        .find_resource(GROUP_RESOURCE_TYPE, name)
        .and_then(|r| r.id.as_deref())
    {
        Some(id) => decode_identity(id)
            .map(Some)
            .map_err(|e| format!("{}.{}: {}", GROUP_RESOURCE_TYPE, name, e)),
        None => Ok(None),
    }
}

/// Compare the configuration with state and the device, without writing anything
async fn build_plan<G>(config: &Config, gateway: &G, state: &StateFile) -> Result<Plan, String>
where
    G: OrderedListGateway<Entry = BgpExportRule> + SettingsGateway,
{
    let reconciler = GroupReconciler::new(gateway);
    let mut plan = Plan::new();

    for group in &config.bgp_export_rule_groups {
        let id = group.resource_id();
        let desired = group.desired_identity()?;
        let previous = previous_identity(state, &group.name)?;

        let effect = match &previous {
            None => diff_group(&desired, &group.rules, None, None).into_effect(id),
            Some(previous) => match reconciler.rehydrate(previous).await {
                Ok(current) => {
                    diff_group(&desired, &group.rules, Some(previous), Some(&current))
                        .into_effect(id)
                }
                // The group can still be placed if the anchor comes back or changes
                Err(err @ GroupError::AnchorMissing { .. }) => Some(Effect::Update {
                    id,
                    reasons: vec![err.to_string()],
                }),
                Err(err) => return Err(format!("{}: {}", id, err)),
            },
        };
        if let Some(effect) = effect {
            plan.add(effect);
        }
    }

    let declared: HashSet<&str> = config
        .bgp_export_rule_groups
        .iter()
        .map(|g| g.name.as_str())
        .collect();
    for orphan in state
        .resources_of(GROUP_RESOURCE_TYPE)
        .filter(|r| !declared.contains(r.name.as_str()))
    {
        plan.add(Effect::Delete(ResourceId::new(
            GROUP_RESOURCE_TYPE,
            &orphan.name,
        )));
    }

    for settings in &config.settings {
        let changed = plan_settings(gateway, &settings.target, &settings.settings)
            .await
            .map_err(|e| format!("{}: {}", settings.resource_id(), e))?;
        if !changed.is_empty() {
            plan.add(Effect::Update {
                id: settings.resource_id(),
                reasons: changed.iter().map(|f| format!("set {}", f)).collect(),
            });
        }
    }

    Ok(plan)
}

/// Execute every effect of the plan, recording successes in `state`.
/// Returns the number of effects that succeeded and failed.
async fn apply_plan<G>(
    config: &Config,
    gateway: &G,
    plan: &Plan,
    state: &mut StateFile,
) -> (usize, usize)
where
    G: OrderedListGateway<Entry = BgpExportRule> + SettingsGateway,
{
    let reconciler = GroupReconciler::new(gateway);
    let mut success_count = 0;
    let mut failure_count = 0;

    for effect in plan.effects() {
        match apply_effect(config, gateway, &reconciler, effect, state).await {
            Ok(()) => {
                println!("  {} {}", "✓".green(), format_effect(effect));
                success_count += 1;
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), format_effect(effect), e);
                failure_count += 1;
            }
        }
    }

    (success_count, failure_count)
}

/// Drop settings records the configuration no longer declares. Settings are
/// never removed from the device, only forgotten. Returns how many went.
fn forget_undeclared_settings(config: &Config, state: &mut StateFile) -> usize {
    let forgotten: Vec<ResourceId> = state
        .resources
        .iter()
        .filter(|r| r.resource_type != GROUP_RESOURCE_TYPE)
        .map(|r| ResourceId::new(&r.resource_type, &r.name))
        .filter(|id| !config.declares(id))
        .collect();
    for id in &forgotten {
        log::info!("{} is no longer declared, removing it from state", id);
        state.remove_resource(&id.resource_type, &id.name);
    }
    forgotten.len()
}

async fn apply_effect<G>(
    config: &Config,
    gateway: &G,
    reconciler: &GroupReconciler<'_, G>,
    effect: &Effect,
    state: &mut StateFile,
) -> Result<(), String>
where
    G: OrderedListGateway<Entry = BgpExportRule> + SettingsGateway,
{
    let id = effect.id();

    if id.resource_type == GROUP_RESOURCE_TYPE {
        let previous = previous_identity(state, &id.name)?;
        match effect {
            Effect::Delete(_) => {
                if let Some(previous) = &previous {
                    reconciler
                        .dissolve(previous)
                        .await
                        .map_err(|e| e.to_string())?;
                }
                state.remove_resource(GROUP_RESOURCE_TYPE, &id.name);
            }
            Effect::Create(_) | Effect::Update { .. } => {
                let group = config
                    .group(&id.name)
                    .ok_or_else(|| format!("{} is not declared", id))?;
                let identity = reconciler
                    .reconcile(
                        &group.scope(),
                        group.directive()?,
                        &group.position_reference,
                        &group.rules,
                        previous.as_ref(),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                state.upsert_resource(group_state(group, &identity));
            }
        }
        return Ok(());
    }

    let settings = config
        .settings_for(id)
        .ok_or_else(|| format!("{} is not declared", id))?;
    let change = merge_then_edit(gateway, &settings.target, &settings.settings)
        .await
        .map_err(|e| e.to_string())?;
    log::debug!(
        "{}: {} field(s) changed",
        id,
        change.changed_fields.len()
    );
    state.upsert_resource(settings_state(settings)?);
    Ok(())
}

fn group_state(group: &GroupConfig, identity: &CompositeIdentity) -> ResourceState {
    ResourceState::new(GROUP_RESOURCE_TYPE, &group.name)
        .with_id(identity.encode())
        .with_attribute("position_keyword", json!(identity.directive().keyword()))
        .with_attribute("rules", json!(identity.names()))
}

fn settings_state(settings: &SettingsConfig) -> Result<ResourceState, String> {
    let fields = settings
        .settings
        .to_fields()
        .map_err(|e| format!("{}: {}", settings.resource_id(), e))?;
    let mut resource = ResourceState::new(settings.section().resource_type(), &settings.name);
    resource.attributes = fields.into_iter().collect();
    Ok(resource)
}

#[derive(Debug, Default)]
struct RefreshReport {
    /// Groups whose first rule is gone, removed from state
    vanished: Vec<String>,
    /// Group name and a description of how it drifted
    drifted: Vec<(String, String)>,
}

impl RefreshReport {
    fn is_clean(&self) -> bool {
        self.vanished.is_empty() && self.drifted.is_empty()
    }
}

/// Re-read every group in state. Vanished groups are dropped from state,
/// surviving ones get their recorded rule list updated.
async fn refresh_state<G>(gateway: &G, state: &mut StateFile) -> Result<RefreshReport, String>
where
    G: OrderedListGateway<Entry = BgpExportRule>,
{
    let reconciler = GroupReconciler::new(gateway);
    let mut report = RefreshReport::default();

    let stored: Vec<ResourceState> = state.resources_of(GROUP_RESOURCE_TYPE).cloned().collect();
    for resource in stored {
        let Some(identity) = previous_identity(state, &resource.name)? else {
            continue;
        };

        match reconciler.rehydrate(&identity).await {
            Ok(Rehydration::Gone) => {
                state.remove_resource(GROUP_RESOURCE_TYPE, &resource.name);
                report.vanished.push(resource.name);
            }
            Ok(Rehydration::Found(readout)) => {
                if !readout.dropped.is_empty() {
                    report.drifted.push((
                        resource.name.clone(),
                        format!("rules no longer in the group: {}", readout.dropped.join(", ")),
                    ));
                }
                if !readout.position_correct {
                    let wanted = if identity.anchor().is_empty() {
                        identity.directive().to_string()
                    } else {
                        format!("{} {:?}", identity.directive(), identity.anchor())
                    };
                    report
                        .drifted
                        .push((resource.name.clone(), format!("not positioned {}", wanted)));
                }
                state.upsert_resource(
                    resource.with_attribute("rules", json!(readout.names())),
                );
            }
            Err(err @ GroupError::AnchorMissing { .. }) => {
                report.drifted.push((resource.name, err.to_string()));
            }
            Err(err) => return Err(format!("{}.{}: {}", GROUP_RESOURCE_TYPE, resource.name, err)),
        }
    }

    Ok(report)
}

/// Dissolve every group in state and drop it, along with recorded settings
async fn destroy_groups<G>(gateway: &G, state: &mut StateFile) -> (usize, usize)
where
    G: OrderedListGateway<Entry = BgpExportRule>,
{
    let reconciler = GroupReconciler::new(gateway);
    let mut success_count = 0;
    let mut failure_count = 0;

    let names: Vec<String> = state
        .resources_of(GROUP_RESOURCE_TYPE)
        .map(|r| r.name.clone())
        .collect();
    for name in names {
        let effect = Effect::Delete(ResourceId::new(GROUP_RESOURCE_TYPE, &name));
        let result = match previous_identity(state, &name) {
            Ok(Some(identity)) => reconciler
                .dissolve(&identity)
                .await
                .map_err(|e| e.to_string()),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                state.remove_resource(GROUP_RESOURCE_TYPE, &name);
                println!("  {} {}", "✓".green(), format_effect(&effect));
                success_count += 1;
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), format_effect(&effect), e);
                failure_count += 1;
            }
        }
    }

    state
        .resources
        .retain(|r| r.resource_type == GROUP_RESOURCE_TYPE);

    (success_count, failure_count)
}

fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("{}", "No changes. Device is up-to-date.".green());
        return;
    }

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    for effect in plan.effects() {
        match effect {
            Effect::Create(id) => println!("  {} {}", "+".green().bold(), id),
            Effect::Update { id, reasons } => {
                println!("  {} {}", "~".yellow().bold(), id);
                for reason in reasons {
                    println!("      {}", reason.dimmed());
                }
            }
            Effect::Delete(id) => println!("  {} {}", "-".red().bold(), id),
        }
    }

    println!();
    let summary = plan.summary();
    println!(
        "Plan: {} to add, {} to change, {} to destroy.",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.delete.to_string().red()
    );
}

fn format_effect(effect: &Effect) -> String {
    match effect {
        Effect::Create(id) => format!("Create {}", id),
        Effect::Update { id, .. } => format!("Update {}", id),
        Effect::Delete(id) => format!("Delete {}", id),
    }
}

fn print_identity(identity: &CompositeIdentity) {
    let scope = identity.scope();
    match &scope.target {
        Target::Firewall => println!("{:<20} firewall", "target:".bold()),
        Target::Panorama {
            template,
            template_stack,
        } => {
            println!("{:<20} panorama", "target:".bold());
            if !template.is_empty() {
                println!("{:<20} {}", "template:".bold(), template);
            }
            if !template_stack.is_empty() {
                println!("{:<20} {}", "template_stack:".bold(), template_stack);
            }
        }
    }
    println!("{:<20} {}", "virtual_router:".bold(), scope.virtual_router);
    println!(
        "{:<20} {:?}",
        "position_keyword:".bold(),
        identity.directive().keyword()
    );
    if !identity.anchor().is_empty() {
        println!("{:<20} {}", "position_reference:".bold(), identity.anchor());
    }
    println!("{}", "rules:".bold());
    for name in identity.names() {
        println!("  • {}", name);
    }
}
