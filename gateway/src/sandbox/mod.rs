//! Sandbox side-effect providers.
//!
//! Feature handlers never talk to real email, payment or storage
//! vendors from the gateway; these capability traits are the only
//! side-effect surface they see, and preview always binds the mock
//! implementations. A production deployment would bind real providers
//! at the composition root instead.

pub mod email;
pub mod payment;
pub mod storage;

use std::sync::Arc;

pub use email::{EmailProvider, MockEmailProvider};
pub use payment::{MockPaymentProvider, PaymentProvider};
pub use storage::{MockStorageProvider, StorageProvider};

/// The provider bundle attached to every tenant request.
pub struct SandboxProviders {
    /// Concretely typed: the inspection endpoint needs access to the
    /// recorded mailbox, which only the mock exposes.
    pub email: Arc<MockEmailProvider>,
    pub payment: Arc<dyn PaymentProvider>,
    pub storage: Arc<dyn StorageProvider>,
}

impl SandboxProviders {
    pub fn mock() -> SandboxProviders {
        SandboxProviders {
            email: Arc::new(MockEmailProvider::default()),
            payment: Arc::new(MockPaymentProvider),
            storage: Arc::new(MockStorageProvider),
        }
    }
}
