// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ticket tracking for hosted Git repositories.
//!
//! Ticketry layers an issue tracker on top of a directory full of Git
//! repositories. Tickets are never stored as records. Every change to a
//! ticket is appended to its __journal__, and current state is whatever
//! folding that journal yields.
//!
//! Journals can live in two places, behind one [`TicketService`] contract:
//!
//! - Inside the hosted repository itself, committed onto refs reserved for
//!   ticket data. See [`service::journal`].
//! - Inside an external key/value store. See [`service::external`].
//!
//! The [`git`] module provides the object access both the journal backend
//! and the command line front end build upon.

pub mod allocator;
pub mod config;
pub mod git;
pub mod path;
pub mod service;
pub mod ticket;

pub use service::{open_service, TicketError, TicketEvent, TicketService};
pub use ticket::{NewTicket, Status, Ticket, TicketFilter, TicketId, TicketPatch};
