//! Schema runner for the ledger database.
//!
//! `migration [up | down [n] | fresh | reset | status]`, against
//! `DATABASE_URL` or a local `tally.db`.

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::prelude::*;

const DEFAULT_DATABASE: &str = "sqlite:./tally.db?mode=rwc";

const USAGE: &str = "\
usage: migration <action>

  up          apply every pending migration (default)
  down [n]    roll back the last n migrations (default 1)
  fresh       drop every table, then apply everything
  reset       roll back every migration
  status      list applied and pending migrations";

enum Action {
    Up,
    Down(u32),
    Fresh,
    Reset,
    Status,
}

impl Action {
    fn parse(mut args: impl Iterator<Item = String>) -> Option<Self> {
        let action = match args.next().as_deref() {
            None | Some("up") => Self::Up,
            Some("down") => match args.next() {
                None => Self::Down(1),
                Some(steps) => Self::Down(steps.parse().ok()?),
            },
            Some("fresh") => Self::Fresh,
            Some("reset") => Self::Reset,
            Some("status") => Self::Status,
            Some(_) => return None,
        };
        args.next().is_none().then_some(action)
    }

    async fn run(self, db: &DatabaseConnection) -> Result<(), DbErr> {
        match self {
            Self::Up => migration::Migrator::up(db, None).await,
            Self::Down(steps) => migration::Migrator::down(db, Some(steps)).await,
            Self::Fresh => migration::Migrator::fresh(db).await,
            Self::Reset => migration::Migrator::reset(db).await,
            Self::Status => migration::Migrator::status(db).await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(action) = Action::parse(std::env::args().skip(1)) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
    let db = Database::connect(&url).await?;
    action.run(&db).await?;
    Ok(())
}
