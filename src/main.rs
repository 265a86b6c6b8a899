//! Pledge Checkout CLI
//!
//! Command-line interface for inspecting configuration, requesting intents
//! and running simulated payment sessions.

use clap::{Parser, Subcommand};
use pledge_checkout::audit_log::AuditLog;
use pledge_checkout::intent::IntentRequest;
use pledge_checkout::orchestrator::describe;
use pledge_checkout::simulator::{
    ConfirmReply, IntentReply, ProviderScript, ScriptedIntentRequester, SimulatedWidgetProvider,
};
use pledge_checkout::widget::{ConfirmOutcome, WidgetEvent};
use pledge_checkout::{
    ClassifiedError, Config, HttpIntentRequester, IntentRequester, PaymentRequest, Result,
    SessionError, SessionObserver, SessionOrchestrator, SessionStatus, WidgetSlot,
};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pledge-session")]
#[command(about = "Payment session controller for hosted secure widgets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Config,

    /// Request a transaction secret from the configured intent endpoint
    Intent {
        /// Amount in minor currency units
        #[arg(short, long)]
        amount: u64,

        /// Recipient identifier
        #[arg(short, long)]
        recipient: String,

        /// ISO 4217 currency code
        #[arg(long, default_value = "EUR")]
        currency: String,
    },

    /// Run one payment session against the in-process provider
    Simulate {
        /// Amount in minor currency units
        #[arg(short, long)]
        amount: u64,

        /// Recipient identifier
        #[arg(short, long)]
        recipient: String,

        /// ISO 4217 currency code
        #[arg(long, default_value = "EUR")]
        currency: String,

        /// Have the provider decline the payment
        #[arg(long)]
        decline: bool,

        /// Start with incomplete card input, then complete it
        #[arg(long)]
        incomplete: bool,

        /// Fail the first intent request, then retry
        #[arg(long)]
        setup_failure: bool,

        /// Use the configured intent endpoint instead of the scripted backend
        #[arg(long)]
        live_intent: bool,
    },
}

/// Prints caller callbacks to stdout
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_success(&self, confirmation_id: &str) {
        println!("Payment SUCCEEDED");
        println!("  Confirmation: {}", confirmation_id);
    }

    fn on_error(&self, error: &SessionError) {
        println!("Payment FAILED");
        println!("  Reason: {}", error.classified_message());
    }

    fn on_cancel(&self) {
        println!("Payment cancelled");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (ignore if not found)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!(
                "API key: {}",
                if config.intent.api_key().is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
        }
        Commands::Intent {
            amount,
            recipient,
            currency,
        } => {
            run_intent(&config, amount, recipient, currency).await?;
        }
        Commands::Simulate {
            amount,
            recipient,
            currency,
            decline,
            incomplete,
            setup_failure,
            live_intent,
        } => {
            let scenario = Scenario {
                decline,
                incomplete,
                setup_failure,
                live_intent,
            };
            run_simulate(config, amount, recipient, currency, scenario).await?;
        }
    }

    Ok(())
}

async fn run_intent(config: &Config, amount: u64, recipient: String, currency: String) -> Result<()> {
    let request = PaymentRequest {
        amount,
        currency: currency.to_ascii_uppercase(),
        recipient_id: recipient,
    };
    config
        .session
        .validate(&request)
        .map_err(SessionError::from)?;

    let requester = HttpIntentRequester::from_config(&config.intent)?;
    tracing::info!(
        amount = request.amount,
        currency = %request.currency,
        recipient_id = %request.recipient_id,
        "Requesting intent"
    );

    match requester.create(&IntentRequest::from_payment(&request)).await {
        Ok(intent) => {
            println!("Intent CREATED");
            println!("  Attempt id: {}", intent.attempt_id);
            println!(
                "  Secret: [REDACTED] ({} chars)",
                intent.secret.expose_secret().len()
            );
        }
        Err(e) => {
            println!("Intent FAILED");
            println!("  Reason: {}", e);
        }
    }
    Ok(())
}

struct Scenario {
    decline: bool,
    incomplete: bool,
    setup_failure: bool,
    live_intent: bool,
}

async fn run_simulate(
    config: Config,
    amount: u64,
    recipient: String,
    currency: String,
    scenario: Scenario,
) -> Result<()> {
    let requester: Arc<dyn IntentRequester> = if scenario.live_intent {
        Arc::new(HttpIntentRequester::from_config(&config.intent)?)
    } else {
        let scripted = ScriptedIntentRequester::new();
        if scenario.setup_failure {
            scripted.queue(IntentReply::error(
                pledge_checkout::intent::IntentError::Network("connection reset".to_string()),
            ));
        }
        Arc::new(scripted)
    };

    let script = if scenario.incomplete {
        ProviderScript::incomplete()
    } else {
        ProviderScript::filled_in()
    };
    let provider = Arc::new(SimulatedWidgetProvider::new(script));
    if scenario.decline {
        provider.queue_confirm(ConfirmReply::Outcome(ConfirmOutcome::failed(
            ClassifiedError::declined("card declined"),
        )));
    }

    let mut orchestrator = SessionOrchestrator::new(
        config.session,
        requester,
        provider.clone(),
        WidgetSlot::new("payment-element"),
    )
    .with_observer(Arc::new(ConsoleObserver));
    if let Some(path) = &config.audit_log_path {
        orchestrator = orchestrator.with_audit_log(AuditLog::new(path));
    }

    orchestrator.start(amount, recipient, currency)?;
    let mut status = orchestrator
        .run_until(|s| s == SessionStatus::Ready || s.is_failed())
        .await;

    if status.is_failed() && scenario.setup_failure {
        println!("Retrying...");
        orchestrator.retry()?;
        status = orchestrator
            .run_until(|s| s == SessionStatus::Ready || s.is_failed())
            .await;
    }
    if status != SessionStatus::Ready {
        return Ok(());
    }
    orchestrator.drain().await;

    if let Err(e) = orchestrator.submit() {
        println!("Submit REJECTED");
        println!("  Reason: {}", e.classified_message());
        if let Some(widget_error) = orchestrator.widget_error() {
            println!("  Widget: {}", widget_error.message);
        }
        if !scenario.incomplete {
            return Ok(());
        }

        provider.emit_latest(WidgetEvent::Change {
            complete: true,
            error: None,
        });
        orchestrator.drain().await;
        orchestrator.submit()?;
    }

    orchestrator
        .run_until(|s| s == SessionStatus::Succeeded || s.is_failed())
        .await;
    tracing::debug!(session = %describe(&orchestrator), "Session finished");
    Ok(())
}
