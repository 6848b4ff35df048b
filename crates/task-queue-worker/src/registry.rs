//! Process-wide worker registry.
//!
//! Handlers get in either through [`register_worker`] at runtime or
//! declaratively with [`worker_task!`](crate::worker_task), which records a
//! [`WorkerDeclaration`] at link time. [`register_declared_workers`] copies
//! the declarations into the registry; doing that twice changes nothing.

use crate::error::Result;
use crate::handler::Handler;
use crate::worker::Worker;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// A handler declared with [`worker_task!`](crate::worker_task)
pub struct WorkerDeclaration {
    pub task_definition_name: &'static str,
    pub handler: fn() -> Handler,
    pub polling_interval_ms: Option<u64>,
    pub domain: Option<&'static str>,
}

inventory::collect!(WorkerDeclaration);

/// Declare a handler for a task type.
///
/// `$handler` is a `fn() -> Handler`. Optional `polling_interval_ms` and
/// `domain` become the worker's explicit values.
///
/// ```ignore
/// fn echo() -> Handler {
///     Handler::fields(["x"], |inputs: Inputs| Ok(inputs.into_map()))
/// }
///
/// worker_task!("echo" => echo);
/// worker_task!("slow_echo" => echo, polling_interval_ms = 1000, domain = "batch");
/// ```
#[macro_export]
macro_rules! worker_task {
    (@submit $name:literal, $handler:path, $ms:expr, $domain:expr) => {
        $crate::inventory::submit! {
            $crate::registry::WorkerDeclaration {
                task_definition_name: $name,
                handler: $handler,
                polling_interval_ms: $ms,
                domain: $domain,
            }
        }
    };
    ($name:literal => $handler:path) => {
        $crate::worker_task!(@submit $name, $handler, ::core::option::Option::None, ::core::option::Option::None);
    };
    ($name:literal => $handler:path, polling_interval_ms = $ms:expr) => {
        $crate::worker_task!(@submit $name, $handler, ::core::option::Option::Some($ms), ::core::option::Option::None);
    };
    ($name:literal => $handler:path, domain = $domain:literal) => {
        $crate::worker_task!(@submit $name, $handler, ::core::option::Option::None, ::core::option::Option::Some($domain));
    };
    ($name:literal => $handler:path, polling_interval_ms = $ms:expr, domain = $domain:literal) => {
        $crate::worker_task!(@submit $name, $handler, ::core::option::Option::Some($ms), ::core::option::Option::Some($domain));
    };
}

/// One registry entry
#[derive(Debug, Clone)]
pub struct Registration {
    pub handler: Handler,
    pub polling_interval: Option<Duration>,
    pub domain: Option<String>,
}

impl Registration {
    pub fn new(handler: Handler) -> Self {
        Registration {
            handler,
            polling_interval: None,
            domain: None,
        }
    }

    fn from_declaration(declaration: &WorkerDeclaration) -> Self {
        Registration {
            handler: (declaration.handler)(),
            polling_interval: declaration.polling_interval_ms.map(Duration::from_millis),
            domain: declaration.domain.map(str::to_string),
        }
    }
}

static REGISTRY: Lazy<RwLock<BTreeMap<String, Registration>>> =
    Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Register a handler for a task type, replacing any earlier entry
pub fn register_worker(task_type: impl Into<String>, handler: Handler) {
    register(task_type, Registration::new(handler));
}

/// Register a handler with explicit polling interval and domain
pub fn register(task_type: impl Into<String>, registration: Registration) {
    let task_type = task_type.into();
    debug!("Registered handler for {}", task_type);
    REGISTRY.write().insert(task_type, registration);
}

/// Copy every [`worker_task!`](crate::worker_task) declaration into the
/// registry. Entries already present are left alone, so repeated calls
/// are no-ops. Returns the number of newly registered task types.
pub fn register_declared_workers() -> usize {
    let mut registry = REGISTRY.write();
    let mut added = 0;

    for declaration in inventory::iter::<WorkerDeclaration> {
        if registry.contains_key(declaration.task_definition_name) {
            continue;
        }
        registry.insert(
            declaration.task_definition_name.to_string(),
            Registration::from_declaration(declaration),
        );
        added += 1;
    }

    if added > 0 {
        debug!("Registered {} declared worker(s)", added);
    }
    added
}

/// Registered task type names, sorted
pub fn registered_task_types() -> Vec<String> {
    REGISTRY.read().keys().cloned().collect()
}

pub fn is_registered(task_type: &str) -> bool {
    REGISTRY.read().contains_key(task_type)
}

/// One worker per registry entry, sorted by task type name
pub fn discover_workers() -> Result<Vec<Worker>> {
    let registry = REGISTRY.read();
    registry
        .iter()
        .map(|(name, registration)| {
            let mut builder = Worker::builder(name.clone()).handler(registration.handler.clone());
            if let Some(interval) = registration.polling_interval {
                builder = builder.polling_interval(interval);
            }
            if let Some(domain) = &registration.domain {
                builder = builder.domain(domain.clone());
            }
            builder.build()
        })
        .collect()
}
