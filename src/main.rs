//! Auth Bridge administration tool
//!
//! Maintains the claims policy store and drives the sign-in pipeline from
//! the command line, which is handy for checking a claim provider's
//! configuration or a captured SAML response without a web front end.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use auth_bridge::bridge::RELAY_STATE_FIELD;
use auth_bridge::claims::Claim;
use auth_bridge::policy::document::RuleElement;
use auth_bridge::policy::{ClaimType, Issuer, PolicyDocument, PolicyRule, PolicyStore};
use auth_bridge::saml::handler::SAML_RESPONSE_FIELD;
use auth_bridge::{AuthBridge, BridgeConfig, ClaimsPolicyEvaluator, HttpRequest, ProtocolDiscovery};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "auth-bridge")]
#[command(about = "Identity federation bridge: claims policy and SAML sign-in tooling")]
struct Args {
    /// Path to the bridge configuration file
    #[arg(long, short, default_value = "auth-bridge.json", env = "AUTH_BRIDGE_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, env = "AUTH_BRIDGE_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the claim providers offered for home realm discovery
    Providers,

    /// Inspect or change the claims policy
    Policy {
        #[command(subcommand)]
        action: PolicyCommand,
    },

    /// Apply a scope's rules to a JSON array of claims
    Evaluate {
        #[arg(long)]
        scope: String,

        /// File holding the input claims
        #[arg(long)]
        claims: PathBuf,
    },

    /// Exercise a SAML claim provider
    Saml {
        #[command(subcommand)]
        action: SamlCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Print every scope as a policy document
    Scopes,

    AddScope {
        uri: String,
    },

    AddIssuer {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        uri: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        thumbprint: Option<String>,
    },

    AddClaimType {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        display_name: Option<String>,
    },

    /// Add a rule read from a JSON file in policy document form
    AddRule {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        rule: PathBuf,
    },

    /// Remove a rule read from a JSON file in policy document form
    RemoveRule {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        rule: PathBuf,
    },

    RemoveIssuer {
        #[arg(long)]
        scope: String,
        /// Issuer display name
        #[arg(long)]
        issuer: String,
    },
}

#[derive(Subcommand, Debug)]
enum SamlCommand {
    /// Print the redirect that starts sign-in at a claim provider
    Request {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        realm: String,
        /// Address to return to after sign-in
        #[arg(long)]
        return_url: Option<String>,
    },

    /// Verify a base64 SAMLResponse and print the evaluated identity
    Verify {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        realm: String,
        /// File holding the base64 SAMLResponse form value
        #[arg(long)]
        response: PathBuf,
    },

    /// Complete an IdP-initiated sign-in with the default scope
    IdpInitiated {
        #[arg(long, default_value = "saml2")]
        protocol: String,
        #[arg(long)]
        response: PathBuf,
        #[arg(long)]
        relay_state: Option<String>,
    },
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_rule(store: &PolicyStore, scope: &str, path: &Path) -> Result<PolicyRule> {
    let element: RuleElement = serde_json::from_str(&read_file(path)?)
        .with_context(|| format!("Failed to parse rule {:?}", path))?;
    let scope = store.retrieve_scope(scope)?;
    Ok(element.resolve_in(&scope)?)
}

fn run_policy(config: &BridgeConfig, action: PolicyCommand) -> Result<()> {
    let store = config.policy_store.open()?;

    match action {
        PolicyCommand::Scopes => {
            let scopes = store.retrieve_scopes()?;
            println!("{}", PolicyDocument::from_scopes(&scopes).to_json()?);
        }
        PolicyCommand::AddScope { uri } => store.add_scope(&uri)?,
        PolicyCommand::AddIssuer {
            scope,
            uri,
            display_name,
            thumbprint,
        } => {
            let mut issuer = match display_name {
                Some(name) => Issuer::with_display_name(uri, name),
                None => Issuer::new(uri),
            };
            issuer.thumbprint = thumbprint;
            store.add_issuer(&scope, &issuer)?;
        }
        PolicyCommand::AddClaimType {
            scope,
            full_name,
            display_name,
        } => {
            let display_name = display_name.unwrap_or_else(|| full_name.clone());
            store.add_claim_type(&scope, &ClaimType::new(full_name, display_name))?;
        }
        PolicyCommand::AddRule { scope, rule } => {
            let rule = read_rule(&store, &scope, &rule)?;
            store.add_policy_rule(&scope, rule)?;
        }
        PolicyCommand::RemoveRule { scope, rule } => {
            let rule = read_rule(&store, &scope, &rule)?;
            store.remove_policy_rule(&scope, &rule)?;
        }
        PolicyCommand::RemoveIssuer { scope, issuer } => {
            let found = store
                .retrieve_issuer(&scope, &issuer)?
                .ok_or_else(|| anyhow!("Issuer '{}' not found in scope {}", issuer, scope))?;
            store.remove_issuer(&scope, &found)?;
        }
    }

    Ok(())
}

fn run_evaluate(config: &BridgeConfig, scope: &str, path: &Path) -> Result<()> {
    let mut claims: Vec<Claim> = serde_json::from_str(&read_file(path)?)
        .with_context(|| format!("Failed to parse claims {:?}", path))?;
    for claim in &mut claims {
        if claim.original_issuer.is_empty() {
            claim.original_issuer = claim.issuer.clone();
        }
    }

    let evaluator = ClaimsPolicyEvaluator::new(Arc::new(config.policy_store.open()?));
    print_json(&evaluator.evaluate(scope, &claims)?)
}

async fn run_saml(config: BridgeConfig, action: SamlCommand) -> Result<()> {
    let reply_url = config.multi_protocol_issuer.reply_url.clone();
    let store = Arc::new(config.policy_store.open()?);
    let discovery = ProtocolDiscovery::from_config(&config).await?;
    let bridge = AuthBridge::new(config, store, discovery);

    match action {
        SamlCommand::Request {
            provider,
            realm,
            return_url,
        } => {
            let mut request = HttpRequest::parse(&reply_url)
                .with_context(|| format!("Invalid reply url {}", reply_url))?;
            if let Some(return_url) = return_url {
                request
                    .url
                    .query_pairs_mut()
                    .append_pair("wctx", &format!("ru={}", return_url));
            }
            let redirect = bridge.sign_in(&provider, &realm, &request)?;
            println!("{}", redirect.location);
        }
        SamlCommand::Verify {
            provider,
            realm,
            response,
        } => {
            let request = HttpRequest::parse(&reply_url)?
                .with_form_field(SAML_RESPONSE_FIELD, read_file(&response)?.trim());
            let completion = bridge.complete_sign_in(&provider, &realm, "", &request)?;
            print_json(&completion.identity)?;
        }
        SamlCommand::IdpInitiated {
            protocol,
            response,
            relay_state,
        } => {
            let mut request = HttpRequest::parse(&reply_url)?
                .with_form_field(SAML_RESPONSE_FIELD, read_file(&response)?.trim());
            if let Some(relay_state) = relay_state {
                request = request.with_form_field(RELAY_STATE_FIELD, relay_state);
            }
            let completion = bridge.complete_idp_initiated(&protocol, &request)?;
            info!(original_url = %completion.original_url, "IdP initiated sign-in completed");
            print_json(&completion.identity)?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::from_file(&args.config)?;
    info!(
        identifier = %config.multi_protocol_issuer.identifier,
        claim_providers = config.claim_providers.len(),
        "Configuration loaded"
    );

    match args.command {
        Command::Providers => {
            let bridge = AuthBridge::new(
                config.clone(),
                Arc::new(config.policy_store.open()?),
                ProtocolDiscovery::new(),
            );
            for provider in bridge.home_realm_discovery() {
                println!("{}\t{}", provider.identifier, provider.display_name);
            }
            Ok(())
        }
        Command::Policy { action } => run_policy(&config, action),
        Command::Evaluate { scope, claims } => run_evaluate(&config, &scope, &claims),
        Command::Saml { action } => run_saml(config, action).await,
    }
}
