//! Doorlist Ticketing Module
//!
//! Ticket inventory and admission control:
//!
//! - **Inventory Reservation Guard**: capacity validation with an
//!   authoritative re-check inside the committing transaction, so concurrent
//!   purchases can never oversell a fixed-capacity ticket type
//! - **Check-In**: the single forward unchecked → checked-in transition,
//!   permitted only inside the event's scheduled window

pub mod checkin;
pub mod error;
pub mod inventory;

pub use checkin::{CheckInOutcome, CheckInService};
pub use error::{TicketError, TicketResult};
pub use inventory::{InventoryGuard, IssueTicketsParams, IssuedTicket, TicketRequest};
