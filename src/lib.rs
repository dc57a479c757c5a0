//! Browsing-time ledger and alarm scheduler behind the desktop pet overlay.
//!
//! The browser extension forwards tab events and overlay commands to
//! [`companion::Companion`], which charges elapsed time per domain through
//! [`ledger::DomainTimeLedger`] and keeps alarms in
//! [`alarms::AlarmScheduler`]. Both persist through a [`storage::Store`].

pub mod alarms;
pub mod companion;
pub mod config;
pub mod domain;
pub mod ledger;
pub mod storage;
