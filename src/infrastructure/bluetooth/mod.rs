//! Bluetooth Module
//!
//! Collaborators the session bridge drives: the BLE transport, the WT9011
//! frame parser and the WT9011 command builder.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Transport                          │
//! │     (trait - scan, connect, subscribe, write, ...)       │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol  │
//! │ (WinRT)   │  │  (WinRT)   │  │           │
//! │ - adverts │  │ - GATT     │  │ - frames  │
//! │           │  │ - notify   │  │ - commands│
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - WT9011 frame parsing and command encoding
//! - [`transport`] - Transport trait and collaborator bundle
//! - `scanner`, `connection`, `service` - WinRT backend (Windows only)
//! - `mock_transport` - scripted transport for tests and simulation

pub mod protocol;
pub mod transport;

#[cfg(windows)]
pub mod connection;
#[cfg(windows)]
pub mod scanner;
#[cfg(windows)]
pub mod service;

#[cfg(any(test, feature = "mock-transport"))]
pub mod mock_transport;

pub use protocol::{CommandBuilder, FrameParser, ParseError, Wt9011Commands, Wt9011Parser};
pub use transport::{Collaborators, FrameReceiver, Transport};
