// Login prompts

use dialoguer::{Confirm, Input, Password};
use std::io::IsTerminal;

use super::reauth::{LoginOutcome, LoginPrompt};
use super::types::RefreshMaterial;
use crate::connection::{Connection, ConnectionKind};
use crate::error::{AuthError, Result};

fn prompt_error(err: dialoguer::Error) -> AuthError {
    match err {
        dialoguer::Error::IO(e) if e.kind() == std::io::ErrorKind::Interrupted => AuthError::UserCancelled,
        dialoguer::Error::IO(e) => AuthError::Internal(format!("Prompt failed: {}", e)),
        #[allow(unreachable_patterns)]
        other => AuthError::Internal(format!("Prompt failed: {}", other)),
    }
}

/// Terminal login: asks the user to confirm, then to paste the device-authorization result
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl LoginPrompt for TerminalPrompt {
    fn login(&self, connection: &Connection) -> Result<LoginOutcome> {
        if !std::io::stdin().is_terminal() || !std::io::stderr().is_terminal() {
            return Err(AuthError::NoInteractiveContext);
        }

        let start_url = match &connection.kind {
            ConnectionKind::BearerToken { start_url, .. } => start_url.as_str(),
            ConnectionKind::StaticCredentials { .. } => {
                return Err(AuthError::UnsupportedConnection(connection.id.clone()))
            }
        };

        eprintln!();
        eprintln!("Connection '{}' needs to be reauthenticated.", connection.label);
        eprintln!("Complete sign-in at: {}", start_url);
        eprintln!();

        let proceed = Confirm::new()
            .with_prompt(format!("Sign in to {}?", connection.label))
            .default(true)
            .interact_opt()
            .map_err(prompt_error)?;
        if proceed != Some(true) {
            return Ok(LoginOutcome::Cancelled);
        }

        let client_id: String = Input::new()
            .with_prompt("Registered client id")
            .interact_text()
            .map_err(prompt_error)?;
        let client_secret = Password::new()
            .with_prompt("Registered client secret")
            .interact()
            .map_err(prompt_error)?;
        let refresh_token = Password::new()
            .with_prompt("Refresh token")
            .interact()
            .map_err(prompt_error)?;

        if refresh_token.trim().is_empty() {
            return Ok(LoginOutcome::Cancelled);
        }

        Ok(LoginOutcome::Completed(RefreshMaterial {
            refresh_token: refresh_token.trim().to_string(),
            client_id: client_id.trim().to_string(),
            client_secret: client_secret.trim().to_string(),
            access_token: None,
            expires_at: None,
            scopes: connection.scopes.iter().cloned().collect(),
        }))
    }
}

/// Prompt for contexts with no UI: every login fails with `NoInteractiveContext`
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessPrompt;

impl LoginPrompt for HeadlessPrompt {
    fn login(&self, connection: &Connection) -> Result<LoginOutcome> {
        tracing::warn!(connection = %connection.id, "Login requested without an interactive context");
        Err(AuthError::NoInteractiveContext)
    }
}
