// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ticket query predicates.

use crate::ticket::{Status, Ticket};

use glob::Pattern;
use std::cmp::Reverse;

/// Ordering of listed tickets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TicketOrder {
    #[default]
    IdAscending,
    IdDescending,
    UpdatedDescending,
    CreatedDescending,
}

/// Predicates a listed ticket must satisfy.
///
/// Every predicate left unset matches everything. Set predicates are
/// combined with logical AND.
#[derive(Debug, Default, Clone)]
pub struct TicketFilter {
    /// Ticket status is any of these, unless empty.
    pub statuses: Vec<Status>,

    /// Exact milestone match.
    pub milestone: Option<String>,

    /// Some label matches this glob pattern.
    pub label: Option<Pattern>,

    /// Exact responsible party match.
    pub responsible: Option<String>,

    pub order: TicketOrder,
}

impl TicketFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.statuses.push(status);
        self
    }

    /// Match only open work, i.e., every status that is not closed.
    pub fn active(mut self) -> Self {
        self.statuses
            .extend(Status::ALL.into_iter().filter(|status| !status.is_closed()));
        self
    }

    pub fn milestone(mut self, milestone: impl Into<String>) -> Self {
        self.milestone = Some(milestone.into());
        self
    }

    /// Match labels against glob pattern.
    ///
    /// # Errors
    ///
    /// - Return [`glob::PatternError`] if pattern is invalid.
    pub fn label(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.label = Some(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn responsible(mut self, who: impl Into<String>) -> Self {
        self.responsible = Some(who.into());
        self
    }

    pub fn order(mut self, order: TicketOrder) -> Self {
        self.order = order;
        self
    }

    /// Check if ticket satisfies every predicate.
    pub fn matches(&self, ticket: &Ticket) -> bool {
        if ticket.deleted {
            return false;
        }

        if !self.statuses.is_empty() && !self.statuses.contains(&ticket.status) {
            return false;
        }

        if self
            .milestone
            .as_ref()
            .is_some_and(|milestone| ticket.milestone.as_ref() != Some(milestone))
        {
            return false;
        }

        if self
            .responsible
            .as_ref()
            .is_some_and(|who| ticket.responsible.as_ref() != Some(who))
        {
            return false;
        }

        match &self.label {
            Some(pattern) => ticket.labels.iter().any(|label| pattern.matches(label)),
            None => true,
        }
    }

    /// Keep matching tickets, sorted by requested order.
    pub fn apply(&self, tickets: impl IntoIterator<Item = Ticket>) -> Vec<Ticket> {
        let mut tickets = tickets
            .into_iter()
            .filter(|ticket| self.matches(ticket))
            .collect::<Vec<_>>();

        match self.order {
            TicketOrder::IdAscending => tickets.sort_by_key(|ticket| ticket.id),
            TicketOrder::IdDescending => tickets.sort_by_key(|ticket| Reverse(ticket.id)),
            TicketOrder::UpdatedDescending => {
                tickets.sort_by_key(|ticket| (Reverse(ticket.updated_at), ticket.id))
            }
            TicketOrder::CreatedDescending => {
                tickets.sort_by_key(|ticket| (Reverse(ticket.created_at), ticket.id))
            }
        }

        tickets
    }
}
