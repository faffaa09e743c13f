use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Holder reference (id or contact) did not resolve.
    HolderNotFound(String),
    ResourceNotFound(Ulid),
    OutOfStock(Ulid),
    HolderHasOpenClaim {
        holder_id: Ulid,
        resource_id: Ulid,
    },
    NoOpenClaim {
        holder_id: Ulid,
        resource_id: Ulid,
    },
    NoResources,
    AlreadyExists(Ulid),
    DuplicateContact(String),
    /// Contact text that would be read as a holder id.
    InvalidContact(String),
    LimitExceeded(&'static str),
    /// A row lock was not granted within the lock timeout. Retryable.
    StoreBusy,
    StoreUnavailable(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreBusy)
    }

    /// Expected rejections, as opposed to infrastructure failures.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            EngineError::OutOfStock(_)
                | EngineError::HolderHasOpenClaim { .. }
                | EngineError::NoOpenClaim { .. }
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::HolderNotFound(_) => "holder_not_found",
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::OutOfStock(_) => "out_of_stock",
            EngineError::HolderHasOpenClaim { .. } => "holder_has_open_claim",
            EngineError::NoOpenClaim { .. } => "no_open_claim",
            EngineError::NoResources => "no_resources",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::DuplicateContact(_) => "duplicate_contact",
            EngineError::InvalidContact(_) => "invalid_contact",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::StoreBusy => "store_busy",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::HolderNotFound(holder) => write!(f, "holder not found: {holder}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::OutOfStock(id) => write!(f, "resource {id} is out of stock"),
            EngineError::HolderHasOpenClaim {
                holder_id,
                resource_id,
            } => write!(
                f,
                "holder {holder_id} already holds resource {resource_id}; release it first"
            ),
            EngineError::NoOpenClaim {
                holder_id,
                resource_id,
            } => write!(f, "holder {holder_id} has no open claim on resource {resource_id}"),
            EngineError::NoResources => write!(f, "no resources in catalog"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DuplicateContact(contact) => {
                write!(f, "contact already registered: {contact}")
            }
            EngineError::InvalidContact(contact) => {
                write!(f, "contact {contact} is a holder id; use another contact")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreBusy => write!(f, "store busy: row lock wait timed out, retry"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
