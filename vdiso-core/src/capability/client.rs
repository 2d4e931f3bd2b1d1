//! Lock-guarded capability cache and the typed per-capability calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{Capability, InjectMode, Request, SignatureVariant};
use crate::display::config::VirtualOutputSpec;
use crate::error::VdError;
use crate::input::event::InputEvent;
use crate::platform::{MethodSignature, OutputToken, ServiceHandle, ServiceRegistry, Value};
use crate::relay::queue::ProducerEndpoint;
use crate::types::DisplayId;

/// Package name the virtual output is created on behalf of.
pub const DEFAULT_OWNER_PACKAGE: &str = "com.android.shell";

// ── BoundInvoker ─────────────────────────────────────────────────

/// A capability resolved to one concrete method on one service.
pub struct BoundInvoker {
    capability: Capability,
    variant: &'static SignatureVariant,
    variant_index: usize,
    service: Arc<dyn ServiceHandle>,
    method: MethodSignature,
}

impl BoundInvoker {
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Position of the chosen signature in the capability's table.
    pub fn variant_index(&self) -> usize {
        self.variant_index
    }

    pub fn variant(&self) -> &'static SignatureVariant {
        self.variant
    }

    /// Lay out `req` for the bound signature and execute it.
    pub fn invoke(&self, req: &Request<'_>) -> Result<Value, VdError> {
        let args = (self.variant.encode)(req).map_err(|e| VdError::from_call(self.capability, e))?;
        self.service
            .call(&self.method, &args)
            .map_err(|e| VdError::from_call(self.capability, e))
    }
}

impl std::fmt::Debug for BoundInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundInvoker")
            .field("capability", &self.capability)
            .field("variant", &self.variant_index)
            .field("method", &self.variant.to_string())
            .finish()
    }
}

// ── CapabilityClient ─────────────────────────────────────────────

/// Single owner of every capability binding for the process.
///
/// `bind` holds the cache lock for the whole probe, so concurrent first
/// use runs exactly one probe and every caller sees the same invoker.
pub struct CapabilityClient {
    registry: Arc<dyn ServiceRegistry>,
    bound: Mutex<HashMap<Capability, Arc<BoundInvoker>>>,
    owner_package: String,
}

impl CapabilityClient {
    pub fn new(registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::with_owner(registry, DEFAULT_OWNER_PACKAGE)
    }

    pub fn with_owner(registry: Arc<dyn ServiceRegistry>, owner_package: impl Into<String>) -> Self {
        Self {
            registry,
            bound: Mutex::new(HashMap::new()),
            owner_package: owner_package.into(),
        }
    }

    /// Whether the privileged channel is usable right now.
    pub fn is_available(&self) -> bool {
        self.registry.is_available()
    }

    pub fn platform_level(&self) -> u32 {
        self.registry.platform_level()
    }

    /// Whether `cap` already has a cached invoker.
    pub fn is_bound(&self, cap: Capability) -> bool {
        self.bound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&cap)
    }

    /// Resolve `cap` to a bound invoker, probing on first use.
    ///
    /// Failures are not cached; the next call probes again.
    pub fn bind(&self, cap: Capability) -> Result<Arc<BoundInvoker>, VdError> {
        let mut bound = self.bound.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(invoker) = bound.get(&cap) {
            return Ok(Arc::clone(invoker));
        }

        let invoker = Arc::new(self.probe(cap)?);
        bound.insert(cap, Arc::clone(&invoker));
        Ok(invoker)
    }

    fn probe(&self, cap: Capability) -> Result<BoundInvoker, VdError> {
        let variants = cap.variants();

        // Services in first-appearance order, each located and listed once.
        let mut services: Vec<(&'static str, Option<(Arc<dyn ServiceHandle>, Vec<MethodSignature>)>)> =
            Vec::new();
        for v in variants {
            if services.iter().any(|(name, _)| *name == v.service) {
                continue;
            }
            let located = self.registry.locate(v.service).map(|handle| {
                let methods = handle.methods();
                (handle, methods)
            });
            services.push((v.service, located));
        }

        if services.iter().all(|(_, located)| located.is_none()) {
            let names: Vec<&str> = services.iter().map(|(name, _)| *name).collect();
            warn!(capability = %cap, "no backing service located");
            return Err(VdError::ServiceDiscovery {
                capability: cap,
                services: names.join(", "),
            });
        }

        let candidates: Vec<String> = services
            .iter()
            .filter_map(|(name, located)| located.as_ref().map(|(_, m)| (name, m)))
            .flat_map(|(name, methods)| {
                methods
                    .iter()
                    .filter(|m| variants.iter().any(|v| v.service == *name && v.method == m.name))
                    .map(move |m| format!("{name}.{m}"))
            })
            .collect();

        for (index, variant) in variants.iter().enumerate() {
            let Some((_, Some((handle, methods)))) =
                services.iter().find(|(name, _)| *name == variant.service)
            else {
                continue;
            };
            let Some(method) = methods.iter().find(|m| variant.matches(handle.name(), m)) else {
                debug!(capability = %cap, variant = %variant, "signature not exposed");
                continue;
            };

            info!(
                capability = %cap,
                chosen = %variant,
                index,
                candidates = ?candidates,
                "capability bound"
            );
            return Ok(BoundInvoker {
                capability: cap,
                variant,
                variant_index: index,
                service: Arc::clone(handle),
                method: method.clone(),
            });
        }

        warn!(capability = %cap, candidates = ?candidates, "no known signature matches");
        Err(VdError::MethodResolution { capability: cap })
    }

    // ── Typed calls ──────────────────────────────────────────────

    /// Create the virtual output described by `spec`.
    pub fn create_virtual_output(
        &self,
        spec: &VirtualOutputSpec,
        token: OutputToken,
    ) -> Result<DisplayId, VdError> {
        let cap = Capability::CreateVirtualOutput;
        let value = self.bind(cap)?.invoke(&Request::CreateOutput {
            spec,
            token,
            owner_package: &self.owner_package,
        })?;
        value
            .as_int()
            .and_then(DisplayId::new)
            .ok_or_else(|| VdError::Invocation {
                capability: cap,
                message: format!("platform returned no usable display id: {value:?}"),
            })
    }

    pub fn destroy_virtual_output(&self, token: OutputToken) -> Result<(), VdError> {
        self.bind(Capability::DestroyVirtualOutput)?
            .invoke(&Request::DestroyOutput { token })
            .map(drop)
    }

    /// Re-target a live virtual output at another producer (or none).
    pub fn set_output_surface(
        &self,
        token: OutputToken,
        endpoint: Option<&ProducerEndpoint>,
    ) -> Result<(), VdError> {
        self.bind(Capability::SetOutputSurface)?
            .invoke(&Request::SetOutputSurface { token, endpoint })
            .map(drop)
    }

    /// Submit one event. Returns whether the platform accepted it.
    pub fn inject_event(
        &self,
        event: &InputEvent,
        display: DisplayId,
        mode: InjectMode,
    ) -> Result<bool, VdError> {
        let value = self.bind(Capability::InjectEvent)?.invoke(&Request::InjectEvent {
            event,
            display,
            mode,
        })?;
        Ok(value.as_bool().unwrap_or(false))
    }

    pub fn query_window_state(&self) -> Result<String, VdError> {
        let cap = Capability::QueryWindowState;
        let value = self.bind(cap)?.invoke(&Request::QueryWindowState)?;
        value.into_string().ok_or(VdError::Invocation {
            capability: cap,
            message: "window state is not text".into(),
        })
    }

    pub fn assert_display_focus(&self, display: DisplayId) -> Result<(), VdError> {
        self.bind(Capability::AssertDisplayFocus)?
            .invoke(&Request::AssertFocus { display })
            .map(drop)
    }

    /// Display that currently holds input focus; `None` for the default
    /// display or when the platform reports nothing usable.
    pub fn focused_display(&self) -> Result<Option<DisplayId>, VdError> {
        let value = self
            .bind(Capability::FocusedDisplay)?
            .invoke(&Request::FocusedDisplay)?;
        Ok(value.as_int().and_then(DisplayId::new))
    }

    /// Assert focus on `display` unless the platform already reports it
    /// as focused.
    pub fn ensure_focused_display(&self, display: DisplayId) -> Result<(), VdError> {
        match self.focused_display() {
            Ok(Some(current)) if current == display => {
                debug!(display = %current, "display already focused");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "focused display unknown"),
        }
        self.assert_display_focus(display)
    }

    /// Best effort; `false` on any failure.
    pub fn move_task_to_display(&self, task_id: i32, display: DisplayId) -> bool {
        let result = self
            .bind(Capability::MoveTaskToDisplay)
            .and_then(|inv| inv.invoke(&Request::MoveTask { task_id, display }));
        match result {
            Ok(Value::Bool(accepted)) => accepted,
            Ok(_) => true,
            Err(e) => {
                let id = display;
                warn!(task_id, display = %id, error = %e, "move task failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::loopback::{LoopbackConfig, LoopbackPlatform};
    use crate::platform::ArgType;
    use std::thread;

    fn client_with(platform: &Arc<LoopbackPlatform>) -> CapabilityClient {
        CapabilityClient::new(Arc::clone(platform) as Arc<dyn ServiceRegistry>)
    }

    #[test]
    fn bind_picks_first_exposed_variant() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = client_with(&platform);
        let inv = client.bind(Capability::InjectEvent).unwrap();
        assert_eq!(inv.variant_index(), 0);
    }

    #[test]
    fn bind_is_cached_and_idempotent() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = client_with(&platform);
        let a = client.bind(Capability::QueryWindowState).unwrap();
        let probes = platform.probe_count("window");
        let b = client.bind(Capability::QueryWindowState).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(platform.probe_count("window"), probes);
    }

    #[test]
    fn missing_service_is_discovery_error() {
        let mut cfg = LoopbackConfig::default();
        cfg.hidden_services = vec!["activity_task".into()];
        let platform = LoopbackPlatform::new(cfg);
        let client = client_with(&platform);
        let err = client.bind(Capability::MoveTaskToDisplay).unwrap_err();
        assert!(matches!(err, VdError::ServiceDiscovery { .. }));
        assert!(!client.is_bound(Capability::MoveTaskToDisplay));
    }

    #[test]
    fn unmatched_signatures_are_resolution_error_and_not_cached() {
        let mut cfg = LoopbackConfig::default();
        cfg.exposed_overrides.insert(
            "input".into(),
            vec![MethodSignature::new(
                "injectInputEvent",
                &[ArgType::InputEvent],
                ArgType::Bool,
            )],
        );
        let platform = LoopbackPlatform::new(cfg);
        let client = client_with(&platform);

        let err = client.bind(Capability::InjectEvent).unwrap_err();
        assert!(matches!(err, VdError::MethodResolution { .. }));
        let probes = platform.probe_count("input");
        let _ = client.bind(Capability::InjectEvent);
        assert!(platform.probe_count("input") > probes);
    }

    #[test]
    fn concurrent_first_use_probes_once() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = Arc::new(client_with(&platform));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                thread::spawn(move || client.bind(Capability::AssertDisplayFocus).unwrap())
            })
            .collect();
        let invokers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(invokers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(platform.probe_count("input"), 1);
    }

    #[test]
    fn ensure_focused_display_skips_when_already_focused() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = client_with(&platform);
        let display = DisplayId::new(4).unwrap();

        client.ensure_focused_display(display).unwrap();
        assert_eq!(platform.focus_asserts(), vec![display]);

        client.ensure_focused_display(display).unwrap();
        assert_eq!(platform.focus_asserts().len(), 1);
    }

    #[test]
    fn move_task_is_best_effort() {
        let platform = LoopbackPlatform::new(LoopbackConfig::default());
        let client = client_with(&platform);
        let display = DisplayId::new(2).unwrap();
        assert!(client.move_task_to_display(17, display));
        assert_eq!(platform.task_moves(), vec![(17, display)]);
    }
}
