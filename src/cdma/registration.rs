//! CDMA registration checking.
//!
//! Probes the fast vendor-diagnostic path first (call-manager state, HDR
//! state, serving-system SID/NID); any failure or unsupported operation
//! falls back to the slower AT path (`AT+CAD?` service status, then
//! `AT+CSS?` serving system). "No service" anywhere jumps straight to the
//! terminal step with both technologies left unknown. When at least one of
//! CDMA1x/EVDO comes up registered, an optional detailed-state refinement
//! can upgrade the coarse result to home/roaming.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cdma::{
    CdmaProbe, CdmaRegistrationState, CmSystemMode, HdrAlmpState,
};
use crate::error::Error;
use crate::flow::{Advance, Sequence};
use crate::serial::AtChannel;

/// Pseudo-SID some devices report in `+CSS` when not registered.
const CSS_SID_NO_SERVICE: u32 = 99_999;

/// Outcome of one registration check.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationResult {
    pub cdma1x: CdmaRegistrationState,
    pub evdo: CdmaRegistrationState,
    pub sid: Option<u32>,
    pub nid: Option<u32>,
}

impl RegistrationResult {
    pub fn has_service(&self) -> bool {
        self.cdma1x.is_registered() || self.evdo.is_registered()
    }
}

/// Check progression. The diagnostic probes run first; any of them can fall
/// back into the AT pair, and everything can jump to `Finish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ProbeCallManager,
    ProbeHdr,
    ProbeServingSystem,
    AtServiceStatus,
    AtServingSystem,
    DetailedState,
    Finish,
}

/// One registration check in flight. Construct, then run with
/// [`crate::flow::drive`].
pub struct RegistrationCheck<'a, A: AtChannel, P: CdmaProbe> {
    at: &'a A,
    probe: &'a P,
    timeout: Duration,
    result: RegistrationResult,
}

impl<'a, A: AtChannel, P: CdmaProbe> RegistrationCheck<'a, A, P> {
    pub fn new(at: &'a A, probe: &'a P, timeout: Duration) -> Self {
        Self {
            at,
            probe,
            timeout,
            result: RegistrationResult::default(),
        }
    }

    fn after_probe(&self) -> Step {
        if self.result.has_service() {
            Step::DetailedState
        } else {
            Step::Finish
        }
    }
}

impl<A: AtChannel, P: CdmaProbe> Sequence for RegistrationCheck<'_, A, P> {
    type Step = Step;
    type Output = RegistrationResult;

    fn first_step(&self) -> Step {
        Step::ProbeCallManager
    }

    async fn run_step(&mut self, step: Step) -> Result<Advance<Step, RegistrationResult>, Error> {
        match step {
            Step::ProbeCallManager => match self.probe.call_manager_state().await {
                Ok(cm) if !cm.online || cm.system_mode == CmSystemMode::NoService => {
                    debug!("call manager reports no service");
                    Ok(Advance::Continue(Step::Finish))
                }
                Ok(cm) => {
                    if cm.system_mode == CmSystemMode::Cdma {
                        self.result.cdma1x = CdmaRegistrationState::Registered;
                    }
                    Ok(Advance::Continue(Step::ProbeHdr))
                }
                Err(Error::Unsupported(_)) => Ok(Advance::Continue(Step::AtServiceStatus)),
                Err(e) => {
                    // Diagnostic path is best-effort; the AT path is the
                    // slower but universal fallback.
                    warn!("call-manager probe failed ({e}), falling back to AT");
                    Ok(Advance::Continue(Step::AtServiceStatus))
                }
            },

            Step::ProbeHdr => match self.probe.hdr_state().await {
                Ok(hdr) => {
                    if hdr.hybrid_mode
                        && matches!(
                            hdr.almp_state,
                            HdrAlmpState::Idle | HdrAlmpState::Connected
                        )
                    {
                        self.result.evdo = CdmaRegistrationState::Registered;
                    }
                    Ok(Advance::Continue(Step::ProbeServingSystem))
                }
                Err(Error::Unsupported(_)) => Ok(Advance::Continue(Step::ProbeServingSystem)),
                Err(e) => {
                    warn!("HDR probe failed ({e}), falling back to AT");
                    Ok(Advance::Continue(Step::AtServiceStatus))
                }
            },

            Step::ProbeServingSystem => match self.probe.serving_system().await {
                Ok(ss) => {
                    self.result.sid = Some(ss.sid);
                    self.result.nid = Some(ss.nid);
                    Ok(Advance::Continue(self.after_probe()))
                }
                Err(Error::Unsupported(_)) => Ok(Advance::Continue(self.after_probe())),
                Err(e) => {
                    warn!("serving-system probe failed ({e}), falling back to AT");
                    Ok(Advance::Continue(Step::AtServiceStatus))
                }
            },

            // The AT path is authoritative when reached: its errors are
            // fatal and propagate to the caller.
            Step::AtServiceStatus => {
                let response = self.at.at_command("AT+CAD?", self.timeout).await?;
                match parse_cad(&response) {
                    Some(1) => Ok(Advance::Continue(Step::AtServingSystem)),
                    Some(_) | None => {
                        debug!("+CAD reports no CDMA service");
                        // Restart from nothing: the probe path's guesses do
                        // not survive a no-service answer.
                        self.result.cdma1x = CdmaRegistrationState::Unknown;
                        self.result.evdo = CdmaRegistrationState::Unknown;
                        Ok(Advance::Continue(Step::Finish))
                    }
                }
            }

            Step::AtServingSystem => {
                let response = self.at.at_command("AT+CSS?", self.timeout).await?;
                match parse_css(&response) {
                    Some(sid) if sid != CSS_SID_NO_SERVICE => {
                        self.result.cdma1x = CdmaRegistrationState::Registered;
                        self.result.sid = Some(sid);
                        // NID is not visible through +CSS.
                        Ok(Advance::Continue(Step::DetailedState))
                    }
                    _ => {
                        debug!("+CSS reports no serving system");
                        Ok(Advance::Continue(Step::Finish))
                    }
                }
            }

            Step::DetailedState => match self
                .probe
                .detailed_registration_state(self.result.cdma1x, self.result.evdo)
                .await
            {
                Ok((cdma1x, evdo)) => {
                    self.result.cdma1x = cdma1x;
                    self.result.evdo = evdo;
                    Ok(Advance::Continue(Step::Finish))
                }
                // Refinement is optional; coarse states stand.
                Err(Error::Unsupported(_)) => Ok(Advance::Continue(Step::Finish)),
                Err(e) => {
                    warn!("detailed registration state failed ({e}), keeping coarse states");
                    Ok(Advance::Continue(Step::Finish))
                }
            },

            Step::Finish => {
                info!(
                    "registration: cdma1x={} evdo={} sid={:?} nid={:?}",
                    self.result.cdma1x.as_str(),
                    self.result.evdo.as_str(),
                    self.result.sid,
                    self.result.nid
                );
                Ok(Advance::Done(self.result))
            }
        }
    }
}

// ── AT response parsers ──────────────────────────────────────────────

/// Parse `AT+CAD?` → service indicator (`+CAD: 1` means CDMA available).
fn parse_cad(response: &str) -> Option<u8> {
    let line = response.lines().find(|l| l.contains("+CAD:"))?;
    line.split(':').nth(1)?.trim().parse().ok()
}

/// Parse `AT+CSS?` → SID.
///
/// Response: `+CSS: 2,B,4162` (class, band, SID); some firmware answers
/// `+CSS: ?,?,99999` when not registered.
fn parse_css(response: &str) -> Option<u32> {
    let line = response.lines().find(|l| l.contains("+CSS:"))?;
    let data = line.split(':').nth(1)?.trim();
    data.rsplit(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::cdma::{CallManagerState, HdrState, NoProbe, ServingSystem};
    use crate::flow;

    #[test]
    fn test_parse_cad() {
        assert_eq!(parse_cad("+CAD: 1"), Some(1));
        assert_eq!(parse_cad("\r\n+CAD: 0\r\n"), Some(0));
        assert_eq!(parse_cad("ERROR"), None);
    }

    #[test]
    fn test_parse_css() {
        assert_eq!(parse_css("+CSS: 2,B,4162"), Some(4162));
        assert_eq!(parse_css("+CSS: ?,?,99999"), Some(99_999));
        assert_eq!(parse_css("+CSS: garbage"), None);
    }

    /// Scripted AT channel: canned response per command, call log for
    /// asserting what was (not) issued.
    struct ScriptedAt {
        responses: HashMap<&'static str, Result<String, Error>>,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedAt {
        fn new(entries: &[(&'static str, Result<&str, Error>)]) -> Self {
            let responses = entries
                .iter()
                .map(|(cmd, r)| (*cmd, r.clone().map(String::from)))
                .collect();
            Self {
                responses,
                log: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl AtChannel for ScriptedAt {
        async fn at_command(&self, command: &str, _timeout: Duration) -> Result<String, Error> {
            self.log.lock().unwrap().push(command.to_string());
            self.responses
                .get(command)
                .cloned()
                .unwrap_or_else(|| panic!("unexpected command {command}"))
        }
    }

    fn check<'a, A: AtChannel, P: CdmaProbe>(
        at: &'a A,
        probe: &'a P,
    ) -> RegistrationCheck<'a, A, P> {
        RegistrationCheck::new(at, probe, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_at_path_registers_cdma1x() {
        let at = ScriptedAt::new(&[
            ("AT+CAD?", Ok("+CAD: 1")),
            ("AT+CSS?", Ok("+CSS: 2,B,4162")),
        ]);
        let result = flow::drive(check(&at, &NoProbe), None).await.unwrap();
        assert_eq!(result.cdma1x, CdmaRegistrationState::Registered);
        assert_eq!(result.evdo, CdmaRegistrationState::Unknown);
        assert_eq!(result.sid, Some(4162));
        assert_eq!(result.nid, None);
    }

    #[tokio::test]
    async fn test_no_service_short_circuits() {
        let at = ScriptedAt::new(&[
            ("AT+CAD?", Ok("+CAD: 0")),
            ("AT+CSS?", Ok("+CSS: 2,B,4162")),
        ]);
        let result = flow::drive(check(&at, &NoProbe), None).await.unwrap();
        assert!(!result.has_service());
        assert_eq!(result.sid, None);
        // The serving-system query must not run once service is ruled out.
        assert_eq!(at.calls(), vec!["AT+CAD?"]);
    }

    #[tokio::test]
    async fn test_no_serving_system_means_no_service() {
        let at = ScriptedAt::new(&[
            ("AT+CAD?", Ok("+CAD: 1")),
            ("AT+CSS?", Ok("+CSS: ?,?,99999")),
        ]);
        let result = flow::drive(check(&at, &NoProbe), None).await.unwrap();
        assert!(!result.has_service());
    }

    #[tokio::test]
    async fn test_at_error_is_fatal() {
        let at = ScriptedAt::new(&[("AT+CAD?", Err(Error::ResponseTimeout))]);
        let err = flow::drive(check(&at, &NoProbe), None).await.unwrap_err();
        assert_eq!(err, Error::ResponseTimeout);
    }

    /// Full diagnostic surface: hybrid EVDO device, refinement upgrades the
    /// coarse states.
    struct FullProbe;

    impl CdmaProbe for FullProbe {
        async fn call_manager_state(&self) -> Result<CallManagerState, Error> {
            Ok(CallManagerState {
                system_mode: CmSystemMode::Cdma,
                online: true,
            })
        }

        async fn hdr_state(&self) -> Result<HdrState, Error> {
            Ok(HdrState {
                hybrid_mode: true,
                almp_state: HdrAlmpState::Idle,
            })
        }

        async fn serving_system(&self) -> Result<ServingSystem, Error> {
            Ok(ServingSystem { sid: 22, nid: 3 })
        }

        async fn detailed_registration_state(
            &self,
            cdma1x: CdmaRegistrationState,
            evdo: CdmaRegistrationState,
        ) -> Result<(CdmaRegistrationState, CdmaRegistrationState), Error> {
            let upgrade = |s: CdmaRegistrationState| {
                if s.is_registered() {
                    CdmaRegistrationState::Home
                } else {
                    s
                }
            };
            Ok((upgrade(cdma1x), upgrade(evdo)))
        }
    }

    #[tokio::test]
    async fn test_probe_path_with_refinement() {
        // AT must never be touched when the diagnostic path works.
        let at = ScriptedAt::new(&[]);
        let result = flow::drive(check(&at, &FullProbe), None).await.unwrap();
        assert_eq!(result.cdma1x, CdmaRegistrationState::Home);
        assert_eq!(result.evdo, CdmaRegistrationState::Home);
        assert_eq!(result.sid, Some(22));
        assert_eq!(result.nid, Some(3));
        assert!(at.calls().is_empty());
    }

    /// Probe whose call-manager query errors out (transport hiccup).
    struct FlakyProbe;

    impl CdmaProbe for FlakyProbe {
        async fn call_manager_state(&self) -> Result<CallManagerState, Error> {
            Err(Error::ResponseTimeout)
        }
    }

    #[tokio::test]
    async fn test_probe_failure_falls_back_to_at() {
        let at = ScriptedAt::new(&[
            ("AT+CAD?", Ok("+CAD: 1")),
            ("AT+CSS?", Ok("+CSS: 2,B,4162")),
        ]);
        let result = flow::drive(check(&at, &FlakyProbe), None).await.unwrap();
        assert_eq!(result.cdma1x, CdmaRegistrationState::Registered);
        assert_eq!(at.calls(), vec!["AT+CAD?", "AT+CSS?"]);
    }

    /// Call manager sees no service at all.
    struct OfflineProbe;

    impl CdmaProbe for OfflineProbe {
        async fn call_manager_state(&self) -> Result<CallManagerState, Error> {
            Ok(CallManagerState {
                system_mode: CmSystemMode::NoService,
                online: true,
            })
        }
    }

    #[tokio::test]
    async fn test_probe_no_service_short_circuits() {
        let at = ScriptedAt::new(&[]);
        let result = flow::drive(check(&at, &OfflineProbe), None).await.unwrap();
        assert!(!result.has_service());
        assert!(at.calls().is_empty());
    }
}
