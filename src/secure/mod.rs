//! C7 — Secure State Store: encrypted-at-rest users, service accounts and
//! account requests, plus the password/permission primitives and the
//! file watcher that reconciles externally-dropped account requests
//! (spec §3, §4.7, §6).

mod account_requests;
mod crypto;
mod password;
mod permission;
mod service_accounts;
mod store;
mod users;
mod watcher;

pub use account_requests::{AccountRequest, AccountRequestStore, IncomingRequest, RequestStatus};
pub use crypto::{derive_key, machine_id};
pub use permission::{has_permission, ip_allowed, Permission};
pub use service_accounts::{ServiceAccount, ServiceAccountStore, ServiceAccountView, MASKED_SECRET};
pub use users::{Role, User, UserStore};
pub use watcher::AccountRequestWatcher;
