//! Database entities

pub mod account;
pub mod authorization;
pub mod certificate;
pub mod challenge;
pub mod nonce;
pub mod order;
pub mod order_authorization;

pub use account::Entity as Account;
pub use authorization::Entity as Authorization;
pub use certificate::Entity as Certificate;
pub use challenge::Entity as Challenge;
pub use nonce::Entity as Nonce;
pub use order::Entity as Order;
pub use order_authorization::Entity as OrderAuthorization;

pub mod prelude {
    pub use super::account::Entity as Account;
    pub use super::authorization::Entity as Authorization;
    pub use super::certificate::Entity as Certificate;
    pub use super::challenge::Entity as Challenge;
    pub use super::nonce::Entity as Nonce;
    pub use super::order::Entity as Order;
    pub use super::order_authorization::Entity as OrderAuthorization;
}
