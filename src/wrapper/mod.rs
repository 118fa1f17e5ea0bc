//! Decorator chains over the request and response of an exchange.
//!
//! Every layer exposes the layer it wraps through [`Wrap::unwrap_one`]; the
//! innermost layer is an [`Origin`] token minted by the exchange. Searches
//! over a chain are plain loops over `unwrap_one`.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One layer of a decorator chain.
pub trait Wrap: Any + Send + Sync {
    /// The layer directly beneath this one, or `None` for an origin.
    fn unwrap_one(&self) -> Option<&Arc<dyn Wrap>>;

    fn as_any(&self) -> &dyn Any;
}

/// Which side of the exchange an [`Origin`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Request,
    Response,
}

/// The undecorated request or response of one exchange.
#[derive(Debug)]
pub struct Origin {
    role: Role,
    exchange_id: u64,
}

impl Origin {
    pub(crate) fn new(role: Role, exchange_id: u64) -> Arc<Self> {
        Arc::new(Self { role, exchange_id })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn exchange_id(&self) -> u64 {
        self.exchange_id
    }
}

impl Wrap for Origin {
    fn unwrap_one(&self) -> Option<&Arc<dyn Wrap>> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A decorator layer carrying a payload of type `T`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use servlet_core::wrapper::{Wrap, Wrapper, is_wrapper_for, is_wrapper_for_type};
///
/// struct Audit(&'static str);
///
/// # let inner: Arc<dyn Wrap> = Wrapper::new(Arc::new(Wrapper::new_root(())), ());
/// let outer = Wrapper::new(inner.clone(), Audit("gzip"));
/// assert!(is_wrapper_for(&outer, &inner));
/// assert!(is_wrapper_for_type::<Wrapper<()>>(&outer));
/// assert!(!is_wrapper_for_type::<Wrapper<Audit>>(&outer));
/// ```
pub struct Wrapper<T> {
    inner: Option<Arc<dyn Wrap>>,
    payload: T,
}

impl<T: Send + Sync + 'static> Wrapper<T> {
    /// Wraps `inner` with one more layer.
    pub fn new(inner: Arc<dyn Wrap>, payload: T) -> Arc<dyn Wrap> {
        Arc::new(Self {
            inner: Some(inner),
            payload,
        })
    }

    /// A free-standing layer with nothing beneath it.
    pub fn new_root(payload: T) -> Self {
        Self {
            inner: None,
            payload,
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T: Send + Sync + 'static> Wrap for Wrapper<T> {
    fn unwrap_one(&self) -> Option<&Arc<dyn Wrap>> {
        self.inner.as_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// `true` if `target` is reachable strictly beneath `outer`.
pub fn is_wrapper_for(outer: &Arc<dyn Wrap>, target: &Arc<dyn Wrap>) -> bool {
    let mut cursor = outer.unwrap_one();
    while let Some(layer) = cursor {
        if same_layer(layer, target) {
            return true;
        }
        cursor = layer.unwrap_one();
    }
    false
}

/// `true` if some layer strictly beneath `outer` has concrete type `T`.
pub fn is_wrapper_for_type<T: Wrap>(outer: &Arc<dyn Wrap>) -> bool {
    let mut cursor = outer.unwrap_one();
    while let Some(layer) = cursor {
        if layer.as_any().is::<T>() {
            return true;
        }
        cursor = layer.unwrap_one();
    }
    false
}

/// Walks down to the innermost layer of a chain.
pub fn innermost(outer: &Arc<dyn Wrap>) -> &Arc<dyn Wrap> {
    let mut layer = outer;
    while let Some(next) = layer.unwrap_one() {
        layer = next;
    }
    layer
}

/// Identity comparison that ignores vtable pointers.
pub fn same_layer(a: &Arc<dyn Wrap>, b: &Arc<dyn Wrap>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_exchange_id() -> u64 {
    NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed)
}
