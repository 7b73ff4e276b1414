use std::error::Error;

use accounting::{
    AccountingService, AllocateCmd, GrantId, ProductCategoryId, ReportUsageRequest, SqlStore,
    WalletFilter, WalletSnapshot,
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use migration::MigratorTrait;
use sea_orm::{Database, DatabaseConnection};

#[derive(Parser, Debug)]
#[command(name = "tally_admin")]
#[command(about = "Admin utilities for the tally accounting ledger")]
struct Cli {
    /// Database connection string (also read from `DATABASE_URL`).
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./tally.db?mode=rwc")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate quota to an owner, from the root or from a parent owner.
    Allocate(AllocateArgs),
    /// Report usage for an owner.
    Charge(ChargeArgs),
    /// Run the allocation lifecycle scan now.
    Scan,
    /// Show the wallets of an owner.
    Wallet(WalletArgs),
    /// Print `id,maxUsable,treeUsage,quota` for every wallet.
    Dump,
    /// Print the mermaid diagram of an owner's wallet.
    Mermaid(MermaidArgs),
}

#[derive(Args, Debug)]
struct CategoryArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    category: String,
}

impl CategoryArgs {
    fn id(&self) -> ProductCategoryId {
        ProductCategoryId::new(&self.category, &self.provider)
    }
}

#[derive(Args, Debug)]
struct AllocateArgs {
    #[command(flatten)]
    category: CategoryArgs,
    #[arg(long)]
    recipient: String,
    /// Parent owner. The allocation comes from the root when omitted.
    #[arg(long)]
    parent: Option<String>,
    #[arg(long)]
    quota: i64,
    /// RFC 3339 timestamp, defaults to now.
    #[arg(long)]
    start: Option<DateTime<Utc>>,
    /// RFC 3339 timestamp.
    #[arg(long)]
    end: DateTime<Utc>,
    #[arg(long)]
    grant: Option<i64>,
}

#[derive(Args, Debug)]
struct ChargeArgs {
    #[command(flatten)]
    category: CategoryArgs,
    #[arg(long)]
    owner: String,
    #[arg(long)]
    usage: i64,
    /// Treat `usage` as the new total instead of an increment.
    #[arg(long)]
    absolute: bool,
    #[arg(long)]
    scope: Option<String>,
}

#[derive(Args, Debug)]
struct WalletArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    children: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct MermaidArgs {
    #[command(flatten)]
    category: CategoryArgs,
    #[arg(long)]
    owner: String,
    /// Print the residual network of a charge instead of the wallet tree.
    #[arg(long)]
    residual: bool,
}

async fn connect_db(database_url: &str) -> Result<DatabaseConnection, Box<dyn Error + Send + Sync>> {
    let db = Database::connect(database_url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

fn print_wallet(wallet: &WalletSnapshot) {
    println!(
        "{} {} [{}] usage {} / quota {} (usable {}){}",
        wallet.id,
        wallet.owner.reference(),
        wallet.category,
        wallet.total_usage,
        wallet.quota,
        wallet.max_usable,
        if wallet.locked { " locked" } else { "" }
    );
    for group in &wallet.groups {
        println!(
            "  <- {} usage {} / quota {}",
            group.parent, group.usage, group.quota
        );
        for alloc in &group.allocations {
            println!(
                "     {} {} {} [{} .. {})",
                alloc.id, alloc.state, alloc.quota, alloc.start, alloc.end
            );
        }
    }
    for child in &wallet.children {
        println!("  -> {} usage {} / quota {}", child.wallet, child.usage, child.quota);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter("tally_admin=info,accounting=info")
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let now = Utc::now();

    let store = SqlStore::new(connect_db(&cli.database_url).await?);
    let service = AccountingService::load(&store).await?;

    match cli.command {
        Command::Allocate(args) => {
            let category = args.category.id();
            let recipient = service.wallet_by_owner(now, &category, &args.recipient)?;
            let mut cmd = AllocateCmd::new(
                category.clone(),
                recipient,
                args.quota,
                args.start.unwrap_or(now),
                args.end,
            );
            if let Some(parent) = &args.parent {
                cmd = cmd.parent(service.wallet_by_owner(now, &category, parent)?);
            }
            if let Some(grant) = args.grant {
                cmd = cmd.granted_in(GrantId(grant));
            }

            let id = service.allocate(now, &cmd)?;
            if let Some(grant) = cmd.granted_in {
                service.commit_grant(grant);
            }
            println!("created allocation: {id}");
        }
        Command::Charge(args) => {
            let category = args.category.id();
            let mut request = if args.absolute {
                ReportUsageRequest::absolute(&args.owner, category, args.usage)
            } else {
                ReportUsageRequest::delta(&args.owner, category, args.usage)
            };
            if let Some(scope) = args.scope {
                request = request.scope(scope);
            }

            if service.report_usage(now, &request)? {
                println!("charged {}", args.owner);
            } else {
                println!("charged {}, wallet is locked", args.owner);
            }
        }
        Command::Scan => {
            let outcome = service.scan_all(now);
            println!(
                "activated {} and retired {} allocations",
                outcome.activated, outcome.retired
            );
        }
        Command::Wallet(args) => {
            let mut filter = WalletFilter::default();
            if let Some(provider) = args.provider {
                filter = filter.provider(provider);
            }
            if let Some(category) = args.category {
                filter = filter.category(category);
            }
            if args.children {
                filter = filter.include_children();
            }

            let wallets = service.retrieve_wallets(now, &args.owner, &filter);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&wallets)?);
            } else if wallets.is_empty() {
                eprintln!("no wallets for {}", args.owner);
                std::process::exit(1);
            } else {
                wallets.iter().for_each(print_wallet);
            }
        }
        Command::Dump => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            for row in service.dump(now) {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        Command::Mermaid(args) => {
            let category = args.category.id();
            let Some(wallet) = service
                .retrieve_ancestors(now, &category, &args.owner)
                .first()
                .map(|wallet| wallet.id)
            else {
                eprintln!("no wallet for {} in {category}", args.owner);
                std::process::exit(1);
            };

            let diagram = if args.residual {
                service.charge_graph_mermaid(now, wallet)
            } else {
                service.mermaid(now, wallet)
            };
            if let Some(diagram) = diagram {
                println!("{diagram}");
            }
        }
    }

    let written = service.flush(&store).await?;
    if written > 0 {
        eprintln!("persisted {written} records");
    }

    Ok(())
}
