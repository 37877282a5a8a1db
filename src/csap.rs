//! CSAP registry.
//!
//! A CSAP is a stack of protocol layers created from a specification such
//! as `{ layers { cli : { ... } } }`. The registry assigns identifiers,
//! hands each layer to the [`ProtocolSupport`] registered for its label and
//! routes send / receive operations to the per-layer state.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layer::CliProtocol;
use crate::ndn::AsnValue;

pub type CsapId = u32;

/// Kills whatever an in-flight layer call is blocked on.
#[derive(Clone)]
pub struct AbortHandle {
    abort: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl AbortHandle {
    pub fn new(abort: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self {
            abort: Arc::new(abort),
        }
    }

    /// Returns whether there was anything to abort.
    pub fn abort(&self) -> bool {
        (self.abort)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}

/// Read/write callbacks of an initialised layer.
pub trait RwLayer: Send {
    fn read(&mut self, timeout: Duration, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn write_read(&mut self, timeout: Duration, wbuf: &[u8], rbuf: &mut [u8]) -> Result<usize>;

    fn destroy(&mut self) -> Result<()>;

    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

/// Callbacks of one protocol, shared by every CSAP using it.
pub trait ProtocolSupport: Send + Sync {
    /// Layer label in CSAP specifications
    fn name(&self) -> &'static str;

    fn init(
        &self,
        csap_id: CsapId,
        spec: &AsnValue,
        layer_index: usize,
        config: &Config,
    ) -> Result<Box<dyn RwLayer>>;

    fn destroy(&self, _csap_id: CsapId, layer: &mut dyn RwLayer) -> Result<()> {
        layer.destroy()
    }

    fn generate_bin(&self, template: &AsnValue) -> Result<Bytes>;

    fn match_bin(&self, pattern: &AsnValue, payload: &[u8], parsed: &mut AsnValue) -> Result<()>;

    fn generate_pattern(&self, template: &AsnValue) -> Result<AsnValue>;
}

/// One CSAP: its layer stack and per-layer state.
pub struct Csap {
    pub id: CsapId,
    pub stack: Vec<String>,
    pub layer_data: Vec<Option<Box<dyn RwLayer>>>,
}

struct CsapEntry {
    csap: Mutex<Csap>,
    aborts: Vec<AbortHandle>,
}

pub struct CsapRegistry {
    config: Config,
    protocols: HashMap<&'static str, Arc<dyn ProtocolSupport>>,
    csaps: Mutex<HashMap<CsapId, Arc<CsapEntry>>>,
    next_id: AtomicU32,
}

/// Labels of the `layers` list, top first.
fn stack_of(spec: &AsnValue) -> Result<Vec<String>> {
    match spec.get("layers") {
        Ok(AsnValue::SequenceOf(layers)) if !layers.is_empty() => layers
            .iter()
            .map(|layer| match layer {
                AsnValue::Choice(label, _) => Ok(label.clone()),
                _ => Err(Error::invalid("each layer must be 'label : { ... }'")),
            })
            .collect(),
        Ok(_) => Err(Error::invalid("layers must be a non-empty list")),
        Err(_) => Err(Error::invalid("CSAP specification has no layers")),
    }
}

impl CsapRegistry {
    /// A registry with the CLI protocol registered.
    pub fn new(config: Config) -> Self {
        let mut registry = Self {
            config,
            protocols: HashMap::new(),
            csaps: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        };
        registry.register(Arc::new(CliProtocol));
        registry
    }

    pub fn register(&mut self, protocol: Arc<dyn ProtocolSupport>) {
        self.protocols.insert(protocol.name(), protocol);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn protocol(&self, name: &str) -> Result<&Arc<dyn ProtocolSupport>> {
        self.protocols
            .get(name)
            .ok_or_else(|| Error::UnknownProtocol(name.to_string()))
    }

    fn entry(&self, id: CsapId) -> Result<Arc<CsapEntry>> {
        let csaps = self.csaps.lock().map_err(|_| Error::FatalProtocol("registry lock poisoned".into()))?;
        csaps.get(&id).cloned().ok_or(Error::NoSuchCsap(id))
    }

    pub fn ids(&self) -> Vec<CsapId> {
        let mut ids: Vec<CsapId> = match self.csaps.lock() {
            Ok(csaps) => csaps.keys().copied().collect(),
            Err(poisoned) => poisoned.into_inner().keys().copied().collect(),
        };
        ids.sort_unstable();
        ids
    }

    /// Create a CSAP and initialise every layer of its stack. A failing
    /// layer destroys the ones already initialised.
    pub fn create(&self, spec: &AsnValue) -> Result<CsapId> {
        let stack = stack_of(spec)?;
        for name in &stack {
            self.protocol(name)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut layer_data: Vec<Option<Box<dyn RwLayer>>> = Vec::with_capacity(stack.len());

        for (index, name) in stack.iter().enumerate() {
            let protocol = self.protocol(name)?;
            match protocol.init(id, spec, index, &self.config) {
                Ok(layer) => layer_data.push(Some(layer)),
                Err(e) => {
                    tracing::warn!("CSAP {}: init of layer {} ({}) failed: {}", id, index, name, e);
                    for (i, layer) in layer_data.iter_mut().enumerate() {
                        if let Some(layer) = layer.as_mut() {
                            if let Err(e) = self.protocol(&stack[i])?.destroy(id, layer.as_mut()) {
                                tracing::warn!("CSAP {}: destroy of layer {} failed: {}", id, i, e);
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }

        let aborts = layer_data
            .iter()
            .flatten()
            .filter_map(|layer| layer.abort_handle())
            .collect();
        let entry = Arc::new(CsapEntry {
            csap: Mutex::new(Csap {
                id,
                stack: stack.clone(),
                layer_data,
            }),
            aborts,
        });

        self.csaps
            .lock()
            .map_err(|_| Error::FatalProtocol("registry lock poisoned".into()))?
            .insert(id, entry);
        tracing::info!("CSAP {} created: {}", id, stack.join("."));
        Ok(id)
    }

    /// Run `f` on the CSAP, failing with `Busy` when another operation is in
    /// flight.
    fn with_csap<T>(&self, id: CsapId, f: impl FnOnce(&mut Csap) -> Result<T>) -> Result<T> {
        let entry = self.entry(id)?;
        let mut csap = match entry.csap.try_lock() {
            Ok(csap) => csap,
            Err(TryLockError::WouldBlock) => return Err(Error::Busy(id)),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        f(&mut csap)
    }

    /// Per-layer template of a traffic template: `pdus.<index>`, or the
    /// template itself when it has no `pdus`.
    fn layer_template(template: &AsnValue, index: usize) -> Result<&AsnValue> {
        let pdus = match template.get("pdus") {
            Ok(pdus) => pdus,
            Err(_) => return Ok(template),
        };
        match pdus.read_indexed(index, "") {
            Ok(AsnValue::Choice(_, inner)) => Ok(inner.as_ref()),
            Ok(other) => Ok(other),
            Err(e) => Err(Error::invalid(format!("pdus: {}", e))),
        }
    }

    fn encode(&self, csap: &Csap, template: &AsnValue) -> Result<(usize, Bytes)> {
        // single read/write layer at the top of the stack
        let index = 0;
        let protocol = self.protocol(&csap.stack[index])?;
        let pdu = Self::layer_template(template, index)?;
        Ok((index, protocol.generate_bin(pdu)?))
    }

    /// Send a command and discard its response.
    pub fn send(&self, id: CsapId, template: &AsnValue) -> Result<()> {
        self.with_csap(id, |csap| {
            let (index, bin) = self.encode(csap, template)?;
            let layer = csap.layer_data[index]
                .as_mut()
                .ok_or(Error::NotRunning)?;
            layer.write(&bin)?;
            Ok(())
        })
    }

    /// Send a command and return the parsed response packet.
    pub fn send_recv(&self, id: CsapId, template: &AsnValue, timeout: Duration) -> Result<AsnValue> {
        let recv_buffer = self.config.cli.recv_buffer;
        self.with_csap(id, |csap| {
            let (index, bin) = self.encode(csap, template)?;
            let protocol = self.protocol(&csap.stack[index])?;
            let pattern = protocol.generate_pattern(Self::layer_template(template, index)?)?;

            let mut rbuf = Vec::new();
            rbuf.try_reserve_exact(recv_buffer)
                .map_err(|_| Error::OutOfMemory(recv_buffer))?;
            rbuf.resize(recv_buffer, 0);

            let layer = csap.layer_data[index]
                .as_mut()
                .ok_or(Error::NotRunning)?;
            let n = layer.write_read(timeout, &bin, &mut rbuf)?;

            let mut parsed = AsnValue::empty();
            protocol.match_bin(&pattern, &rbuf[..n], &mut parsed)?;
            Ok(parsed)
        })
    }

    /// Destroy a CSAP. An operation in flight on it is aborted first.
    pub fn destroy(&self, id: CsapId) -> Result<()> {
        let entry = self
            .csaps
            .lock()
            .map_err(|_| Error::FatalProtocol("registry lock poisoned".into()))?
            .remove(&id)
            .ok_or(Error::NoSuchCsap(id))?;

        let mut csap = match entry.csap.try_lock() {
            Ok(csap) => csap,
            Err(TryLockError::WouldBlock) => {
                tracing::info!("CSAP {} is busy, aborting the operation in flight", id);
                for abort in &entry.aborts {
                    abort.abort();
                }
                match entry.csap.lock() {
                    Ok(csap) => csap,
                    Err(poisoned) => poisoned.into_inner(),
                }
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let mut result = Ok(());
        for index in (0..csap.layer_data.len()).rev() {
            let name = csap.stack[index].clone();
            if let Some(mut layer) = csap.layer_data[index].take() {
                if let Err(e) = self.protocol(&name)?.destroy(id, layer.as_mut()) {
                    tracing::warn!("CSAP {}: destroy of layer {} failed: {}", id, index, e);
                    result = Err(e);
                }
            }
        }
        tracing::info!("CSAP {} destroyed", id);
        result
    }
}

impl Drop for CsapRegistry {
    fn drop(&mut self) {
        for id in self.ids() {
            if let Err(e) = self.destroy(id) {
                tracing::warn!("CSAP {}: destroy on shutdown failed: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ndn::parse;
    use std::sync::atomic::AtomicUsize;

    /// Layer that answers every command with its reversed bytes.
    struct Mirror {
        destroyed: Arc<AtomicUsize>,
    }

    impl RwLayer for Mirror {
        fn read(&mut self, _: Duration, _: &mut [u8]) -> Result<usize> {
            Err(Error::NotSupported("read"))
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }

        fn write_read(&mut self, _: Duration, wbuf: &[u8], rbuf: &mut [u8]) -> Result<usize> {
            let n = wbuf.len().min(rbuf.len());
            for (dst, src) in rbuf.iter_mut().zip(wbuf.iter().rev()) {
                *dst = *src;
            }
            Ok(n)
        }

        fn destroy(&mut self) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MirrorProtocol {
        destroyed: Arc<AtomicUsize>,
    }

    impl ProtocolSupport for MirrorProtocol {
        fn name(&self) -> &'static str {
            "mirror"
        }

        fn init(&self, _: CsapId, spec: &AsnValue, index: usize, _: &Config) -> Result<Box<dyn RwLayer>> {
            let layer = crate::spec::get_spec(spec, index)?;
            if layer.contains("fail") {
                return Err(Error::invalid("asked to fail"));
            }
            Ok(Box::new(Mirror {
                destroyed: Arc::clone(&self.destroyed),
            }))
        }

        fn generate_bin(&self, template: &AsnValue) -> Result<Bytes> {
            crate::codec::generate_bin(template)
        }

        fn match_bin(&self, pattern: &AsnValue, payload: &[u8], parsed: &mut AsnValue) -> Result<()> {
            crate::codec::match_bin(pattern, payload, parsed)
        }

        fn generate_pattern(&self, template: &AsnValue) -> Result<AsnValue> {
            Ok(crate::codec::generate_pattern(template))
        }
    }

    fn registry() -> (CsapRegistry, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let mut registry = CsapRegistry::new(Config::default());
        registry.register(Arc::new(MirrorProtocol {
            destroyed: Arc::clone(&destroyed),
        }));
        (registry, destroyed)
    }

    #[test]
    fn test_send_recv_through_registry() {
        let (registry, destroyed) = registry();
        let id = registry.create(&parse("{ layers { mirror : { } } }").unwrap()).unwrap();
        assert_eq!(registry.ids(), vec![id]);

        let template = parse(r#"{ pdus { mirror : { message plain : "abc" } } }"#).unwrap();
        let parsed = registry
            .send_recv(id, &template, Duration::from_secs(1))
            .unwrap();
        assert_eq!(parsed.read_octets("cli.message.plain").unwrap().as_ref(), b"cba");
        registry.send(id, &template).unwrap();

        registry.destroy(id).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.destroy(id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(registry.send(id, &template).is_err());
    }

    #[test]
    fn test_unknown_protocol_and_bad_stack() {
        let (registry, _) = registry();
        let err = registry
            .create(&parse("{ layers { udp : { } } }").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(_)));
        assert!(registry.create(&parse("{ layers { } }").unwrap()).is_err());
        assert!(registry.create(&parse("{ other 1 }").unwrap()).is_err());
    }

    #[test]
    fn test_failed_init_destroys_initialised_layers() {
        let (registry, destroyed) = registry();
        let err = registry
            .create(&parse("{ layers { mirror : { }, mirror : { fail 1 } } }").unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert!(registry.ids().is_empty());
    }

    #[test]
    fn test_busy_csap_rejected() {
        let (registry, _) = registry();
        let id = registry.create(&parse("{ layers { mirror : { } } }").unwrap()).unwrap();
        let entry = registry.entry(id).unwrap();
        let _held = entry.csap.lock().unwrap();

        let template = parse(r#"{ message plain : "x" }"#).unwrap();
        let err = registry.send(id, &template).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn test_abort_handle() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let handle = AbortHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(handle.clone().abort());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
