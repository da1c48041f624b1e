//! Launching the managed application process.

use std::process::{ExitStatus, Stdio};

use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;

pub const PORT_VAR: &str = "TETHER_PORT";
pub const APP_PORT_VAR: &str = "TETHER_APP_PORT";
pub const SIDECAR_VAR: &str = "TETHER_SIDECAR";

/// Environment handed to the application on top of the inherited one.
pub fn child_env(sidecar_port: u16, app_port: u16, sidecar: &str) -> Vec<(String, String)> {
    vec![
        (PORT_VAR.to_owned(), sidecar_port.to_string()),
        (APP_PORT_VAR.to_owned(), app_port.to_string()),
        (SIDECAR_VAR.to_owned(), sidecar.to_owned()),
    ]
}

/// Runs `command` with `env` added until it exits or `cancel` fires, in which
/// case the child is killed.
pub async fn run(
    command: &[String],
    env: &[(String, String)],
    cancel: CancellationToken,
) -> std::io::Result<ExitStatus> {
    let Some((program, args)) = command.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty command",
        ));
    };

    let mut child = TokioCommand::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    tracing::info!(program = %program, pid = child.id(), "Launched application");

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            tracing::info!(status = %status, "Application exited");
            Ok(status)
        }
        () = cancel.cancelled() => {
            tracing::info!(program = %program, "Stopping application");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn env_names() {
        let env = child_env(3500, 8080, "car-1");
        assert_eq!(
            env,
            vec![
                ("TETHER_PORT".to_owned(), "3500".to_owned()),
                ("TETHER_APP_PORT".to_owned(), "8080".to_owned()),
                ("TETHER_SIDECAR".to_owned(), "car-1".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn child_sees_environment() {
        let env = child_env(3500, 8080, "car-1");
        let status = run(
            &sh("test \"$TETHER_PORT\" = 3500 && test \"$TETHER_SIDECAR\" = car-1"),
            &env,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn exit_status_is_reported() {
        let status = run(&sh("exit 3"), &[], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let status = tokio::time::timeout(
            Duration::from_secs(5),
            run(&sh("sleep 30"), &[], cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = run(&[], &[], CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
