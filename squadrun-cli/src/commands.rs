use crate::cli::OutputFormat;
use crate::error::{CliError, Result};
use serde::Serialize;
use serde_json::{Value, json};
use session_auth::{BootstrapOutcome, Profile, Session, SessionClient};
use tracing::{debug, info};

/// Runs CLI commands against a bootstrapped session.
pub struct CommandExecutor {
    client: SessionClient,
    output: OutputFormat,
}

impl CommandExecutor {
    pub fn new(client: SessionClient, output: OutputFormat) -> Self {
        debug!(outcome = ?client.bootstrap_outcome(), "Session bootstrapped");
        Self { client, output }
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let profile = self.client.sign_in(username, password).await?;
        info!(user_id = profile.id, "Login successful");
        self.print_profile("Signed in as", &profile)
    }

    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<()> {
        let profile = self.client.sign_up(username, email, password).await?;
        self.print_profile("Registered and signed in as", &profile)
    }

    pub async fn whoami(&self) -> Result<()> {
        if !self.client.is_authenticated() {
            return Err(CliError::NotSignedIn);
        }

        let profile = match self.client.session().profile {
            Some(profile) => profile,
            None => self.client.refresh_profile().await?,
        };
        self.print_profile("Signed in as", &profile)
    }

    pub fn status(&self) -> Result<()> {
        let session = self.client.session();
        let outcome = self.client.bootstrap_outcome();

        match self.output {
            OutputFormat::Pretty => {
                println!("{}", describe(&session, outcome));
                Ok(())
            }
            _ => self.print_json(&json!({
                "authenticated": session.is_authenticated(),
                "renewable": session.is_renewable(),
                "username": session.profile.as_ref().map(|p| p.username.as_str()),
                "restored": outcome.is_authenticated(),
            })),
        }
    }

    pub async fn get(&self, path: &str) -> Result<()> {
        let body: Value = self.client.get_json(path).await?;
        match self.output {
            OutputFormat::Pretty | OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&body)?)
            }
            OutputFormat::JsonCompact => println!("{}", serde_json::to_string(&body)?),
        }
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let was_signed_in = !self.client.session().is_empty();
        self.client.logout().await;

        if self.output == OutputFormat::Pretty {
            if was_signed_in {
                println!("✓ Signed out");
            } else {
                println!("Not signed in");
            }
            return Ok(());
        }
        self.print_json(&json!({ "status": "signed_out" }))
    }

    fn print_profile(&self, heading: &str, profile: &Profile) -> Result<()> {
        match self.output {
            OutputFormat::Pretty => {
                println!("{heading} {}", profile.username);
                if !profile.display_name.is_empty() {
                    println!("  Name: {}", profile.display_name);
                }
                println!("  ID: {}", profile.id);
                println!("  Points: {}", profile.total_points);
                Ok(())
            }
            _ => self.print_json(profile),
        }
    }

    fn print_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = if self.output == OutputFormat::JsonCompact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        println!("{text}");
        Ok(())
    }
}

fn describe(session: &Session, outcome: BootstrapOutcome) -> String {
    let who = session
        .profile
        .as_ref()
        .map(|p| p.username.as_str())
        .unwrap_or("unknown user");

    match (session.is_authenticated(), outcome) {
        (true, _) => format!("Signed in as {who}"),
        (false, BootstrapOutcome::RenewalFailed) => {
            "Signed out: the stored session was rejected by the server".to_string()
        }
        (false, _) if session.is_renewable() => "Session stored but not active".to_string(),
        (false, _) => "Not signed in".to_string(),
    }
}
