//! Pluggable client features.
//!
//! A module is created from a [`ModuleCatalog`] entry, installed once per
//! connection (usually registering stanza handlers) and uninstalled when the
//! client disconnects.

pub mod muc;
pub mod presence;

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use tracing::{debug, error};

use crate::client::XmppClient;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub &'static str);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

pub trait ClientModule: Send + Sync + 'static {
    fn install(&self, client: &XmppClient) -> Result<(), ClientError>;

    fn uninstall(&self, client: &XmppClient);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A module type with a stable identity and a no-argument constructor.
pub trait RegisteredModule: ClientModule + Sized {
    const ID: ModuleId;

    fn create() -> Self;
}

pub type ModuleFactory = fn() -> Arc<dyn ClientModule>;

fn construct<M: RegisteredModule>() -> Arc<dyn ClientModule> {
    Arc::new(M::create())
}

#[derive(Clone, Copy)]
struct CatalogEntry {
    id: ModuleId,
    factory: ModuleFactory,
    install_on_connect: bool,
}

/// Modules a client knows how to build.
#[derive(Clone, Default)]
pub struct ModuleCatalog {
    entries: Vec<CatalogEntry>,
}

impl ModuleCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Multi-user chat and presence, both installed on connect.
    pub fn with_defaults() -> Self {
        Self::empty()
            .register::<muc::MucModule>()
            .register::<presence::PresenceModule>()
    }

    /// Adds a module that is installed on every connect.
    pub fn register<M: RegisteredModule>(self) -> Self {
        self.register_factory(M::ID, construct::<M>, true)
    }

    /// Adds a module that is only installed when first requested.
    pub fn register_on_demand<M: RegisteredModule>(self) -> Self {
        self.register_factory(M::ID, construct::<M>, false)
    }

    pub fn register_factory(
        mut self,
        id: ModuleId,
        factory: ModuleFactory,
        install_on_connect: bool,
    ) -> Self {
        self.entries.retain(|entry| entry.id != id);
        self.entries.push(CatalogEntry {
            id,
            factory,
            install_on_connect,
        });
        self
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    fn factory(&self, id: ModuleId) -> Option<ModuleFactory> {
        self.entries
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.factory)
    }
}

/// Installed module instances, keyed by identity.
pub struct ModuleRegistry {
    catalog: ModuleCatalog,
    active: DashMap<ModuleId, Arc<dyn ClientModule>>,
    install_lock: ReentrantMutex<()>,
}

impl ModuleRegistry {
    pub fn new(catalog: ModuleCatalog) -> Self {
        Self {
            catalog,
            active: DashMap::new(),
            install_lock: ReentrantMutex::new(()),
        }
    }

    pub fn is_active(&self, id: ModuleId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_ids(&self) -> Vec<ModuleId> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// Installs every catalog entry flagged for connect. Failures are
    /// logged and skipped.
    pub(crate) fn install_defaults(&self, client: &XmppClient) {
        let ids: Vec<ModuleId> = self
            .catalog
            .entries
            .iter()
            .filter(|entry| entry.install_on_connect)
            .map(|entry| entry.id)
            .collect();

        for id in ids {
            if let Err(e) = self.install(id, client) {
                error!(module = %id, error = %e, "Error while installing module");
            }
        }
    }

    /// Returns the installed instance, installing it from the catalog first
    /// if needed.
    pub(crate) fn install(
        &self,
        id: ModuleId,
        client: &XmppClient,
    ) -> Result<Arc<dyn ClientModule>, ClientError> {
        let factory = match self.active.get(&id) {
            Some(existing) => return Ok(Arc::clone(existing.value())),
            None => self
                .catalog
                .factory(id)
                .ok_or_else(|| ClientError::Module(format!("unknown module {id}")))?,
        };
        self.install_with(id, factory, client)
    }

    pub(crate) fn get_or_install<M: RegisteredModule>(
        &self,
        client: &XmppClient,
    ) -> Result<Arc<M>, ClientError> {
        let existing = self.active.get(&M::ID).map(|entry| Arc::clone(entry.value()));
        let module = match existing {
            Some(module) => module,
            None => {
                let factory = self.catalog.factory(M::ID).unwrap_or(construct::<M>);
                self.install_with(M::ID, factory, client)?
            }
        };

        module
            .as_any()
            .downcast::<M>()
            .map_err(|_| ClientError::Module(format!("module {} has an unexpected type", M::ID)))
    }

    fn install_with(
        &self,
        id: ModuleId,
        factory: ModuleFactory,
        client: &XmppClient,
    ) -> Result<Arc<dyn ClientModule>, ClientError> {
        // Reentrant so a module may request another module from `install`.
        let _guard = self.install_lock.lock();
        if let Some(existing) = self.active.get(&id) {
            return Ok(Arc::clone(existing.value()));
        }

        let module = factory();
        module.install(client)?;
        self.active.insert(id, Arc::clone(&module));
        debug!(module = %id, "module installed");
        Ok(module)
    }

    /// Uninstalls every active module exactly once.
    pub(crate) fn uninstall_all(&self, client: &XmppClient) {
        for id in self.active_ids() {
            if let Some((id, module)) = self.active.remove(&id) {
                module.uninstall(client);
                debug!(module = %id, "module uninstalled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use minidom::Element;

    use crate::router::HandlerContext;

    static INSTALLS: AtomicUsize = AtomicUsize::new(0);
    static UNINSTALLS: AtomicUsize = AtomicUsize::new(0);

    struct Counting;

    impl ClientModule for Counting {
        fn install(&self, _client: &XmppClient) -> Result<(), ClientError> {
            INSTALLS.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn uninstall(&self, _client: &XmppClient) {
            UNINSTALLS.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    impl RegisteredModule for Counting {
        const ID: ModuleId = ModuleId("test.counting");

        fn create() -> Self {
            Counting
        }
    }

    struct Broken;

    impl ClientModule for Broken {
        fn install(&self, _client: &XmppClient) -> Result<(), ClientError> {
            Err(ClientError::Module("refusing to install".into()))
        }

        fn uninstall(&self, _client: &XmppClient) {}

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    impl RegisteredModule for Broken {
        const ID: ModuleId = ModuleId("test.broken");

        fn create() -> Self {
            Broken
        }
    }

    static ROUTED_INSTALLS: AtomicUsize = AtomicUsize::new(0);

    /// Registers a handler on install, the way the MUC and presence modules do.
    struct Routed;

    impl ClientModule for Routed {
        fn install(&self, client: &XmppClient) -> Result<(), ClientError> {
            ROUTED_INSTALLS.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            client
                .router()
                .register_fn("test.routed", |_ctx: &HandlerContext<'_>, _stanza: &Element| {});
            Ok(())
        }

        fn uninstall(&self, client: &XmppClient) {
            client.router().unregister_handler("test.routed");
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    impl RegisteredModule for Routed {
        const ID: ModuleId = ModuleId("test.routed");

        fn create() -> Self {
            Routed
        }
    }

    #[test]
    fn concurrent_first_use_installs_once_and_keeps_handler() {
        let client = XmppClient::builder().without_default_modules().build();
        let registry = ModuleRegistry::new(ModuleCatalog::empty().register_on_demand::<Routed>());

        let modules: Vec<Arc<Routed>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| registry.get_or_install::<Routed>(&client).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(ROUTED_INSTALLS.load(Ordering::SeqCst), 1);
        assert!(modules.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert!(client.router().has_handler("test.routed"));
    }

    #[test]
    fn installs_once_and_uninstalls_once() {
        let client = XmppClient::builder().without_default_modules().build();
        let registry = ModuleRegistry::new(ModuleCatalog::empty().register::<Counting>());

        registry.install_defaults(&client);
        let first = registry.get_or_install::<Counting>(&client).unwrap();
        let second = registry.get_or_install::<Counting>(&client).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(INSTALLS.load(Ordering::SeqCst), 1);

        registry.uninstall_all(&client);
        registry.uninstall_all(&client);
        assert_eq!(UNINSTALLS.load(Ordering::SeqCst), 1);
        assert!(!registry.is_active(Counting::ID));
    }

    #[test]
    fn install_failure_does_not_stop_other_modules() {
        let client = XmppClient::builder().without_default_modules().build();
        let registry = ModuleRegistry::new(
            ModuleCatalog::empty()
                .register::<Broken>()
                .register::<muc::MucModule>(),
        );

        registry.install_defaults(&client);
        assert!(!registry.is_active(Broken::ID));
        assert!(registry.is_active(muc::MucModule::ID));
    }

    #[test]
    fn unknown_module_id_is_an_error() {
        let client = XmppClient::builder().without_default_modules().build();
        let registry = ModuleRegistry::new(ModuleCatalog::empty());
        let err = registry
            .install(ModuleId("nope"), &client)
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Module(msg) if msg.contains("nope")));
    }

    #[test]
    fn catalog_replaces_duplicate_ids() {
        let catalog = ModuleCatalog::with_defaults().register_on_demand::<muc::MucModule>();
        assert_eq!(catalog.entries.len(), 2);
        assert!(catalog.contains(presence::PresenceModule::ID));
    }
}
