use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use garcom_pos_lib::config::AppConfig;
use garcom_pos_lib::draft::OrderDraft;
use garcom_pos_lib::menu::{self, LoadedMenu};
use garcom_pos_lib::orders::{self, OrderSubmission, TabRef};
use garcom_pos_lib::queue::StatusCounts;
use garcom_pos_lib::sync::RecordOutcome;
use garcom_pos_lib::{init_logging, queue, tabs, AppContext};

#[derive(Parser)]
#[command(name = "garcom-pos")]
#[command(about = "Offline-first order client for waitstaff", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit console logs as JSON
    #[arg(long, env = "POS_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the session token issued by the order service
    Login {
        #[arg(long, env = "POS_TOKEN")]
        token: String,
    },
    /// Forget the stored session token
    Logout,
    /// Refresh open tabs and send queued orders now
    Sync,
    /// Stay running: probe connectivity and sync on every reconnect
    Watch,
    /// Show the menu (refreshing it when stale and online)
    Menu,
    /// Show cached open tabs
    Tabs {
        /// Refresh the cache from the service first
        #[arg(long)]
        refresh: bool,
        #[command(subcommand)]
        action: Option<TabAction>,
    },
    /// Inspect and manage orders waiting to be sent
    Pending {
        #[command(subcommand)]
        action: Option<PendingAction>,
    },
    /// Place an order on a tab
    Submit {
        /// Tab display number
        #[arg(long)]
        tab: String,
        /// Where the order should be delivered
        #[arg(long, default_value = "")]
        location: String,
        /// Order-level note
        #[arg(long)]
        note: Option<String>,
        /// PRODUCT_ID:QTY[:NOTE], repeatable
        #[arg(long = "line")]
        lines: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TabAction {
    /// Open a new tab on the order service
    Open {
        number: String,
        #[arg(long)]
        customer: Option<String>,
    },
}

#[derive(Subcommand)]
enum PendingAction {
    List,
    /// Permanently delete a queued order
    Discard { local_id: String },
    /// Resend one queued order now, even past the retry ceiling
    Retry { local_id: String },
}

/// One `--line` argument.
#[derive(Debug, PartialEq)]
struct LineArg {
    product_id: i64,
    quantity: u32,
    note: Option<String>,
}

/// One-line queue summary for the status banner.
fn queue_banner(counts: &StatusCounts) -> String {
    if counts.total() == 0 {
        return "no orders waiting".to_string();
    }
    let mut line = format!(
        "{} waiting ({} pending, {} sending, {} failed)",
        counts.total(),
        counts.pending,
        counts.sending,
        counts.error
    );
    if counts.needs_discard > 0 {
        line.push_str(&format!(", {} need discard", counts.needs_discard));
    }
    line
}

fn parse_line(raw: &str) -> Result<LineArg> {
    let mut parts = raw.splitn(3, ':');
    let product_id = parts
        .next()
        .unwrap_or_default()
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid product id in {raw:?}"))?;
    let quantity = match parts.next() {
        Some(q) => q
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid quantity in {raw:?}"))?,
        None => 1,
    };
    if quantity == 0 {
        bail!("quantity must be at least 1 in {raw:?}");
    }
    let note = parts
        .next()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok(LineArg {
        product_id,
        quantity,
        note,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_logging(&config.data_dir, cli.json_logs);

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: AppConfig) -> Result<()> {
    let ctx = AppContext::bootstrap(config).await?;
    let cancel = CancellationToken::new();

    match command {
        Commands::Login { token } => {
            let identity = garcom_pos_lib::auth::identity_from_token(&token)
                .context("token does not carry a user identity")?;
            if !identity.may_take_orders() {
                bail!("this account's role may not take orders");
            }
            ctx.session.set_token(&token).map_err(anyhow::Error::msg)?;
            println!("Signed in as user {}", identity.id);
            ctx.sync.startup_sync(&ctx.session, &cancel).await;
        }
        Commands::Logout => {
            ctx.session.evict();
            println!("Signed out");
        }
        Commands::Sync => {
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            });
            let status = ctx.sync.run_full_sync(&cancel).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if let Some(e) = status.last_error {
                bail!(e);
            }
        }
        Commands::Watch => {
            let mut updates = ctx.sync.subscribe();
            let probe = ctx.connectivity.spawn_probe_loop(
                ctx.gateway.clone(),
                ctx.config.probe_interval,
                cancel.clone(),
            );
            let trigger = ctx.sync.spawn_reconnect_trigger(cancel.clone());
            ctx.sync.startup_sync(&ctx.session, &cancel).await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    update = updates.recv() => match update {
                        Ok(status) if !status.is_syncing => {
                            let summary = status.last_error.as_deref().unwrap_or("ok");
                            let counts = ctx
                                .db
                                .lock()
                                .and_then(|conn| queue::status_counts(&conn, ctx.sync.max_retries()));
                            match counts {
                                Ok(c) => println!("sync finished: {summary}; {}", queue_banner(&c)),
                                Err(e) => println!("sync finished: {summary}; queue unreadable: {e}"),
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "status updates lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            cancel.cancel();
            let _ = tokio::join!(probe, trigger);
            info!("watch stopped");
        }
        Commands::Menu => {
            let LoadedMenu {
                menu,
                source,
                stale,
            } = menu::load_menu(
                &ctx.db,
                ctx.api().as_ref(),
                &ctx.connectivity,
                ctx.config.menu_freshness,
            )
            .await?;
            info!(?source, stale, "menu loaded");
            if stale {
                println!("(offline copy, may be out of date)");
            }
            for category in &menu.categories {
                println!("{}", category.name);
                for product in menu.products.iter().filter(|p| p.category_id == category.id) {
                    let flag = if product.active { "" } else { " [unavailable]" };
                    println!("  {:>5}  {:<32} {:>8.2}{flag}", product.id, product.name, product.unit_price());
                }
            }
        }
        Commands::Tabs {
            action: Some(TabAction::Open { number, customer }),
            ..
        } => {
            let tab = tabs::open_tab(
                &ctx.db,
                ctx.api().as_ref(),
                &ctx.connectivity,
                &number,
                customer.as_deref(),
            )
            .await
            .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("Tab {} opened (id {})", tab.number, tab.id);
        }
        Commands::Tabs {
            refresh,
            action: None,
        } => {
            if refresh {
                let result =
                    tabs::refresh_open_tabs(&ctx.db, ctx.api().as_ref(), &ctx.connectivity).await;
                if let Some(e) = result.error {
                    warn!(error = %e, "tab refresh failed, showing cached tabs");
                }
            }
            for tab in tabs::list_cached(&ctx.db)? {
                println!(
                    "{:>6}  {:<24} {:<16} {:>8.2}",
                    tab.number,
                    tab.customer_name.unwrap_or_default(),
                    tab.location.unwrap_or_default(),
                    tab.running_total.unwrap_or(0.0)
                );
            }
        }
        Commands::Pending { action } => {
            let max_retries = ctx.sync.max_retries();
            match action.unwrap_or(PendingAction::List) {
                PendingAction::List => {
                    let conn = ctx.db.lock()?;
                    println!("{}", queue_banner(&queue::status_counts(&conn, max_retries)?));
                    for view in queue::list_for_display(&conn, max_retries)? {
                        let marker = if view.needs_manual_discard { " [needs discard]" } else { "" };
                        println!(
                            "{}  tab {:<6} {:<12} tries {}  {:>8.2}{marker}  {}",
                            view.order.local_id,
                            view.order.tab_number,
                            view.order.status.as_str(),
                            view.order.retry_count,
                            view.total,
                            view.order.last_error.unwrap_or_default()
                        );
                    }
                }
                PendingAction::Discard { local_id } => {
                    let conn = ctx.db.lock()?;
                    if !queue::discard(&conn, &local_id)? {
                        bail!("no pending order {local_id}");
                    }
                    println!("Discarded {local_id}");
                }
                PendingAction::Retry { local_id } => {
                    match ctx.sync.retry_pending_order(&local_id).await? {
                        RecordOutcome::Sent => println!("Sent {local_id}"),
                        RecordOutcome::Failed(message) | RecordOutcome::Unauthorized(message) => {
                            bail!(message)
                        }
                    }
                }
            }
        }
        Commands::Submit {
            tab,
            location,
            note,
            lines,
        } => {
            let loaded = menu::load_menu(
                &ctx.db,
                ctx.api().as_ref(),
                &ctx.connectivity,
                ctx.config.menu_freshness,
            )
            .await?;
            let mut draft = OrderDraft::new();
            for raw in &lines {
                let line = parse_line(raw)?;
                let product = loaded
                    .menu
                    .product(line.product_id)
                    .with_context(|| format!("unknown product {}", line.product_id))?;
                draft.add_quantity(product, None, &[], line.note.as_deref(), line.quantity)?;
            }

            let tab_ref = match orders::resolve_tab(
                &ctx.db,
                ctx.api().as_ref(),
                &ctx.connectivity,
                &tab,
            )
            .await
            {
                Ok(Some(found)) => found,
                Ok(None) => {
                    warn!(tab = %tab, "tab not found locally or remotely");
                    TabRef::by_number(&tab)
                }
                Err(e) => bail!(e.user_message()),
            };

            let submission = OrderSubmission {
                tab: tab_ref,
                delivery_location: location,
                note,
                lines: draft.to_pending_lines(),
            };
            match ctx.order_capture().submit_order(submission).await {
                Ok(outcome) => println!("{}", outcome.user_message()),
                Err(e) => bail!(e.user_message()),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_forms() {
        assert_eq!(
            parse_line("7").unwrap(),
            LineArg { product_id: 7, quantity: 1, note: None }
        );
        assert_eq!(
            parse_line("7:3:sem gelo: por favor").unwrap(),
            LineArg {
                product_id: 7,
                quantity: 3,
                note: Some("sem gelo: por favor".into())
            }
        );
        assert!(parse_line("x:1").is_err());
        assert!(parse_line("7:0").is_err());
    }

    #[test]
    fn test_cli_parses_tab_open() {
        let cli =
            Cli::try_parse_from(["garcom-pos", "tabs", "open", "12", "--customer", "Ana"]).unwrap();
        match cli.command {
            Commands::Tabs {
                action: Some(TabAction::Open { number, customer }),
                refresh: false,
            } => {
                assert_eq!(number, "12");
                assert_eq!(customer.as_deref(), Some("Ana"));
            }
            _ => panic!("expected tabs open"),
        }
    }

    #[test]
    fn test_queue_banner() {
        assert_eq!(queue_banner(&StatusCounts::default()), "no orders waiting");
        let counts = StatusCounts {
            pending: 2,
            sending: 0,
            error: 1,
            needs_discard: 1,
        };
        assert_eq!(
            queue_banner(&counts),
            "3 waiting (2 pending, 0 sending, 1 failed), 1 need discard"
        );
    }

    #[test]
    fn test_cli_parses_pending_retry() {
        let cli = Cli::try_parse_from(["garcom-pos", "pending", "retry", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Pending {
                action: Some(PendingAction::Retry { .. })
            }
        ));
    }
}
