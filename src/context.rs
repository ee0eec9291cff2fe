//! The execution context: the object an application owns and runs (spec
//! component E).
//!
//! Grounded on the original's top-level `execution_context`/`io_context`
//! pairing: a single object owns the scheduler plus a keyed registry of
//! lazily-created services (timer, resolver, signal), and tearing it down
//! destroys those services in the reverse of their creation order so a
//! later-created service (which may depend on an earlier one still being
//! alive) never outlives what it depends on.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::resolver::ResolverService;
use crate::scheduler::Scheduler;
use crate::timer::TimerService;

struct ServiceRegistry {
    by_type: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    creation_order: Vec<TypeId>,
}

impl ServiceRegistry {
    fn new() -> ServiceRegistry {
        ServiceRegistry {
            by_type: HashMap::new(),
            creation_order: Vec::new(),
        }
    }
}

/// Owns a [`Scheduler`] plus every service (timer, resolver, signal, ...)
/// an application has reached for so far.
#[derive(Clone)]
pub struct ExecutionContext {
    scheduler: Scheduler,
    services: Arc<Mutex<ServiceRegistry>>,
}

impl ExecutionContext {
    pub fn new() -> std::io::Result<ExecutionContext> {
        Ok(ExecutionContext {
            scheduler: Scheduler::new()?,
            services: Arc::new(Mutex::new(ServiceRegistry::new())),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Returns this context's [`TimerService`], creating it on first use.
    pub fn timer(&self) -> TimerService {
        self.get_or_create(|| TimerService::new(&self.scheduler))
    }

    /// Returns this context's [`ResolverService`], creating it on first
    /// use.
    pub fn resolver(&self) -> ResolverService {
        self.get_or_create(|| ResolverService::new(&self.scheduler))
    }

    #[cfg(feature = "signal")]
    pub fn signals(&self) -> crate::signal::SignalService {
        self.get_or_create(|| crate::signal::SignalService::new(&self.scheduler))
    }

    fn get_or_create<T, F>(&self, create: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let type_id = TypeId::of::<T>();
        let mut registry = self.services.lock().unwrap();
        if let Some(existing) = registry.by_type.get(&type_id) {
            return existing.downcast_ref::<T>().unwrap().clone();
        }
        let service = create();
        registry
            .by_type
            .insert(type_id, Arc::new(service.clone()) as Arc<dyn Any + Send + Sync>);
        registry.creation_order.push(type_id);
        service
    }

    /// Stops the scheduler and drops every created service, in the reverse
    /// of the order they were first reached for.
    pub fn shutdown(&self) {
        debug!("execution context shutting down");
        self.scheduler.stop();
        let mut registry = self.services.lock().unwrap();
        while let Some(type_id) = registry.creation_order.pop() {
            registry.by_type.remove(&type_id);
        }
    }

    /// Runs the scheduler until stopped or out of outstanding work.
    pub fn run(&self) -> usize {
        self.scheduler.run()
    }

    /// Drives a single `async fn` written against this crate's futures
    /// (`TcpStream`/`TcpListener` operations, `Sleep`, `Resolve`,
    /// `SignalSet`, ...) to completion on the calling thread.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        crate::block_on::block_on(&self.scheduler, future)
    }
}
