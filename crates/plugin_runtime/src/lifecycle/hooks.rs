use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{PluginError, RuntimeError};
use crate::manifest::LifecycleHook;

/// Time budgets for lifecycle hooks, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HookTimeouts {
    pub load_ms: u64,
    pub activate_ms: u64,
    pub deactivate_ms: u64,
    pub unload_ms: u64,
}

impl Default for HookTimeouts {
    fn default() -> Self {
        Self {
            load_ms: 30_000,
            activate_ms: 30_000,
            deactivate_ms: 15_000,
            unload_ms: 15_000,
        }
    }
}

impl HookTimeouts {
    pub fn budget(&self, hook: LifecycleHook) -> Duration {
        let ms = match hook {
            LifecycleHook::OnLoad => self.load_ms,
            LifecycleHook::OnActivate => self.activate_ms,
            LifecycleHook::OnDeactivate => self.deactivate_ms,
            LifecycleHook::OnUnload => self.unload_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Runs one hook under its budget, turning errors, panics and overruns into
/// `HookFault` / `HookTimeout`.
///
/// When `abort` is given and fires first, the hook is dropped and the call
/// returns `Cancelled`.
pub(crate) async fn run_hook<F>(
    plugin_id: &str,
    hook: LifecycleHook,
    timeouts: &HookTimeouts,
    abort: Option<&CancellationToken>,
    call: F,
) -> Result<(), RuntimeError>
where
    F: Future<Output = Result<(), PluginError>>,
{
    let budget = timeouts.budget(hook);
    let guarded = tokio::time::timeout(budget, AssertUnwindSafe(call).catch_unwind());
    let outcome = match abort {
        Some(abort) => tokio::select! {
            biased;
            _ = abort.cancelled() => {
                return Err(RuntimeError::Cancelled(format!("{} hook of `{plugin_id}`", hook.as_str())));
            }
            outcome = guarded => outcome,
        },
        None => guarded.await,
    };
    match outcome {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(RuntimeError::HookFault {
            plugin: plugin_id.to_string(),
            hook: hook.as_str(),
            message: err.to_string(),
        }),
        Ok(Err(_)) => Err(RuntimeError::HookFault {
            plugin: plugin_id.to_string(),
            hook: hook.as_str(),
            message: "hook panicked".to_string(),
        }),
        Err(_) => Err(RuntimeError::HookTimeout {
            plugin: plugin_id.to_string(),
            hook: hook.as_str(),
            timeout_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> HookTimeouts {
        HookTimeouts {
            activate_ms: 20,
            ..HookTimeouts::default()
        }
    }

    #[tokio::test]
    async fn overrun_becomes_timeout() {
        let err = run_hook("slow", LifecycleHook::OnActivate, &quick(), None, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RuntimeError::HookTimeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn errors_and_panics_become_faults() {
        let err = run_hook("bad", LifecycleHook::OnLoad, &quick(), None, async {
            Err(PluginError::failed("no table"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.tag(), "HookFault");

        let err = run_hook("worse", LifecycleHook::OnLoad, &quick(), None, async {
            if quick().load_ms > 0 {
                panic!("kaboom");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn abort_token_interrupts_a_running_hook() {
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = run_hook("patient", LifecycleHook::OnActivate, &HookTimeouts::default(), Some(&abort), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.tag(), "Cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn defaults_match_documented_budgets() {
        let t = HookTimeouts::default();
        assert_eq!(t.budget(LifecycleHook::OnActivate), Duration::from_secs(30));
        assert_eq!(t.budget(LifecycleHook::OnDeactivate), Duration::from_secs(15));
    }
}
