use clap::{Parser, Subcommand};
use std::path::PathBuf;
use visit_core::constants::DEFAULT_VISIT_DATA_DIR;
use visit_core::{
    ClinicalDraft, DiscountMode, FileDraftStore, GateFlags, PaymentStatus, VisitStatus,
    VisitStatusSnapshot,
};
use visit_uuid::VisitId;

#[derive(Parser)]
#[command(name = "visit")]
#[command(about = "Clinical visit editor CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate the gate flags for a status snapshot
    Gate {
        /// Visit status from the queue service (e.g. called, in-visit)
        #[arg(long)]
        visit_status: VisitStatus,
        /// Payment status (paid, unpaid, pending, refunded)
        #[arg(long)]
        payment_status: Option<PaymentStatus>,
        /// Discount mode (waived, discounted-paid, pending-approval)
        #[arg(long)]
        discount_mode: Option<DiscountMode>,
    },
    /// List persisted drafts
    Drafts {
        /// Visit data directory (defaults to VISIT_DATA_DIR, then visit_data)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print a persisted draft as JSON
    Show {
        /// Visit UUID (32 lowercase hex characters)
        visit_id: String,
        /// Visit data directory (defaults to VISIT_DATA_DIR, then visit_data)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> PathBuf {
    data_dir
        .or_else(|| {
            std::env::var("VISIT_DATA_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VISIT_DATA_DIR))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Gate {
            visit_status,
            payment_status,
            discount_mode,
        }) => {
            let snapshot = VisitStatusSnapshot {
                visit_status,
                payment_status,
                discount_mode,
            };
            // finalisation is judged against a draft that has been saved once
            let mut draft = ClinicalDraft::new(VisitId::new());
            draft.mark_saved(false);

            let flags = GateFlags::evaluate(&draft, &snapshot);
            println!("is_paid:      {}", flags.is_paid);
            println!("can_open:     {}", flags.can_open);
            println!("can_edit:     {}", flags.can_edit);
            println!("can_finalize: {}", flags.can_finalize);
        }
        Some(Commands::Drafts { data_dir }) => {
            let store = FileDraftStore::new(resolve_data_dir(data_dir));
            match store.list().await {
                Ok(drafts) if drafts.is_empty() => println!("No drafts found."),
                Ok(drafts) => {
                    for d in drafts {
                        let state = if d.finalised {
                            "finalised"
                        } else if d.is_draft {
                            "draft"
                        } else {
                            "saved"
                        };
                        println!(
                            "ID: {}, State: {}, Autosaved: {}, Persisted: {}",
                            d.visit_id, state, d.autosaved, d.persisted_at
                        );
                    }
                }
                Err(e) => eprintln!("Error listing drafts: {}", e),
            }
        }
        Some(Commands::Show { visit_id, data_dir }) => {
            let visit_id = VisitId::parse(&visit_id)?;
            let store = FileDraftStore::new(resolve_data_dir(data_dir));
            match store.load(visit_id).await {
                Ok(Some(draft)) => println!("{}", serde_json::to_string_pretty(&draft)?),
                Ok(None) => eprintln!("No draft found for visit {}", visit_id),
                Err(e) => eprintln!("Error reading draft: {}", e),
            }
        }
        None => {
            println!("Use 'visit --help' for commands");
        }
    }

    Ok(())
}
