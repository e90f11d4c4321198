#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use invoice_client::signatures::{
    DIGEST_HEADER, IDENTITY_HEADER, SIGNATURE_HEADER, SIGNATURE_TYPE_HEADER,
    SUPPORTED_SIGNATURE_TYPE,
};
use invoice_client::{
    ClientConfig, EventKind, EventPayload, HttpInvoiceService, InvoiceParams, KeyStore,
    LifecycleCoordinator, LifecycleDeps, SignatureVerifier,
};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "invoice")]
#[command(about = "Create payment invoices and verify signed webhooks")]
pub struct InvoiceCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Create an invoice and follow it until it settles or expires
    Create(CreateArgs),
    /// Verify a captured webhook against trusted signing keys
    VerifyWebhook(VerifyWebhookArgs),
}

#[derive(clap::Args, Debug)]
pub struct CreateArgs {
    /// Payout address
    #[arg(long)]
    pub address: String,
    /// Amount in native units
    #[arg(long)]
    pub amount: u64,
    /// Seconds until the invoice expires
    #[arg(long)]
    pub expires: Option<u64>,
    #[arg(long)]
    pub memo: Option<String>,
    /// Overrides INVOICE_ENDPOINT
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Do not open the push channel
    #[arg(long)]
    pub no_listen: bool,
}

#[derive(clap::Args, Debug)]
pub struct VerifyWebhookArgs {
    /// File holding the raw request body
    #[arg(long)]
    pub body_file: PathBuf,
    /// Value of the `digest` header
    #[arg(long)]
    pub digest: String,
    #[arg(long)]
    pub identity: String,
    /// Base64 signature from the `x-signature` header
    #[arg(long)]
    pub signature: String,
    #[arg(long, default_value = SUPPORTED_SIGNATURE_TYPE)]
    pub signature_type: String,
    /// Trusted server endpoint; repeatable
    #[arg(long = "trust", required = true)]
    pub trust: Vec<String>,
}

pub async fn run(cli: InvoiceCli) -> Result<()> {
    let config = ClientConfig::from_env()?;
    match cli.command {
        Commands::Create(args) => create(config, args).await,
        Commands::VerifyWebhook(args) => verify_webhook(config, args).await,
    }
}

fn create_params(args: &CreateArgs) -> InvoiceParams {
    let mut params = InvoiceParams::new().add_address(args.address.clone(), args.amount);
    if let Some(expires) = args.expires {
        params = params.set_expires(expires);
    }
    if let Some(memo) = &args.memo {
        params = params.set_memo(memo.clone());
    }
    params
}

async fn create(mut config: ClientConfig, args: CreateArgs) -> Result<()> {
    if let Some(endpoint) = &args.endpoint {
        config.endpoint.clone_from(endpoint);
    }
    if args.no_listen {
        config.listen = false;
    }

    let deps = LifecycleDeps::from_config(config).await?;
    let coordinator = LifecycleCoordinator::new(create_params(&args), deps);
    coordinator.on_each(
        &[
            EventKind::Created,
            EventKind::Subscribed,
            EventKind::Requested,
            EventKind::Broadcasting,
            EventKind::Broadcasted,
            EventKind::Confirmed,
            EventKind::Failed,
            EventKind::Expired,
        ],
        |event| match &event.payload {
            EventPayload::Message(data) => info!("{}: {}", event.kind.as_str(), data),
            EventPayload::Error(message) => warn!("{}: {}", event.kind.as_str(), message),
            _ => info!("{}", event.kind.as_str()),
        },
    );
    coordinator.on(EventKind::Timer, |event| {
        if let EventPayload::SecondsRemaining(seconds) = event.payload
            && seconds % 60 == 0
        {
            info!("{} seconds remaining", seconds);
        }
    });

    coordinator.create().await?;
    let state = coordinator.state();
    if let Some(wallet_uri) = state.service().and_then(|service| service.wallet_uri.as_deref()) {
        println!("{wallet_uri}");
    }

    tokio::select! {
        () = coordinator.closed() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("listen for ctrl-c")?;
            coordinator.destroy();
            coordinator.closed().await;
        }
    }

    let summary = json!({
        "id": coordinator.id(),
        "status": coordinator.status().as_str(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn webhook_headers(args: &VerifyWebhookArgs) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in [
        (DIGEST_HEADER, &args.digest),
        (IDENTITY_HEADER, &args.identity),
        (SIGNATURE_HEADER, &args.signature),
        (SIGNATURE_TYPE_HEADER, &args.signature_type),
    ] {
        let value = HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid {name} value"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

async fn verify_webhook(config: ClientConfig, args: VerifyWebhookArgs) -> Result<()> {
    let body = std::fs::read(&args.body_file)
        .with_context(|| format!("read webhook body {}", args.body_file.display()))?;
    let headers = webhook_headers(&args)?;

    let service = HttpInvoiceService::new(&config)?;
    let keystore = Arc::new(KeyStore::new(Arc::new(service)));
    for endpoint in &args.trust {
        keystore
            .register_trusted(endpoint)
            .await
            .with_context(|| format!("trust {endpoint}"))?;
    }

    let verifier = SignatureVerifier::new(keystore);
    let notification = verifier
        .verify_webhook(&body, &headers)
        .await
        .map_err(|error| anyhow!("webhook rejected: {error}"))?;

    let mut output = notification.extra.clone();
    output.insert("event".to_string(), Value::String(notification.event));
    output.insert("invoiceId".to_string(), Value::String(notification.invoice_id));
    println!("{}", serde_json::to_string_pretty(&Value::Object(output))?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn cli_requires_subcommand() {
        let err = match InvoiceCli::try_parse_from(["invoice"]) {
            Ok(_) => panic!("expected missing subcommand parse error"),
            Err(err) => err,
        };
        assert_eq!(
            err.kind(),
            ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn create_parses_into_params() {
        let cli = InvoiceCli::try_parse_from([
            "invoice",
            "create",
            "--address",
            "bitcoincash:qq",
            "--amount",
            "100000",
            "--expires",
            "900",
            "--no-listen",
        ])
        .expect("parse");
        let Commands::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert!(args.no_listen);

        let params = create_params(&args);
        assert_eq!(params.outputs.len(), 1);
        assert_eq!(params.outputs[0].amount, 100_000);
        assert_eq!(params.expires, Some(900));
        assert!(params.memo.is_none());
    }

    #[test]
    fn verify_webhook_requires_a_trusted_endpoint() {
        let err = match InvoiceCli::try_parse_from([
            "invoice",
            "verify-webhook",
            "--body-file",
            "body.json",
            "--digest",
            "abc",
            "--identity",
            "pay.example.com",
            "--signature",
            "sig",
        ]) {
            Ok(_) => panic!("expected missing --trust error"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn verify_webhook_builds_headers() {
        let cli = InvoiceCli::try_parse_from([
            "invoice",
            "verify-webhook",
            "--body-file",
            "body.json",
            "--digest",
            "SHA-256=abc=",
            "--identity",
            "pay.example.com",
            "--signature",
            "c2ln",
            "--trust",
            "https://pay.example.com",
        ])
        .expect("parse");
        let Commands::VerifyWebhook(args) = cli.command else {
            panic!("expected verify-webhook");
        };
        assert_eq!(args.signature_type, "ECC");

        let headers = webhook_headers(&args).expect("headers");
        assert_eq!(
            headers.get(DIGEST_HEADER).and_then(|value| value.to_str().ok()),
            Some("SHA-256=abc=")
        );
        assert_eq!(
            headers.get(SIGNATURE_TYPE_HEADER).and_then(|value| value.to_str().ok()),
            Some("ECC")
        );
    }
}
