//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persisted registry and ledger for tenant service state."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Tag exclusivity rules as a decision table.
//!
//! Two invariants are enforced per version:
//! * a `system ∧ unique` tag is held by at most one snapshot;
//! * a snapshot holds at most one system tag (its "system slot").
//!
//! [`decide`] maps the observable situation to a [`TagDecision`] without
//! touching any record, so the ledger can apply the outcome in a single commit.

use serde::Serialize;

/// What the current holder of the snapshot's system slot looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOccupant {
    /// The snapshot holds no system tag.
    Empty,
    /// The snapshot holds this system tag.
    Held {
        /// Tag currently occupying the slot.
        tag_id: String,
        /// Whether that tag is unique.
        unique: bool,
    },
}

/// Inputs of the decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRequest {
    /// Tag being assigned is a system tag.
    pub system: bool,
    /// Tag being assigned is unique.
    pub unique: bool,
    /// Another snapshot of the same version holds the (unique) tag.
    pub holder: Option<String>,
    /// Caller asked to override exclusivity.
    pub force: bool,
    /// Current system slot of the target snapshot.
    pub slot: SlotOccupant,
}

/// Structured, non-throwing rejection of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "conflict", rename_all = "snake_case")]
pub enum TagConflict {
    /// The unique tag already sits on another snapshot of the version.
    UniqueTagHeldElsewhere {
        /// Snapshot currently holding the tag.
        holder: String,
    },
    /// The target snapshot already holds a system tag.
    SystemSlotOccupied {
        /// Tag occupying the slot.
        tag_id: String,
        /// Whether the occupying tag is unique.
        unique: bool,
    },
}

impl std::fmt::Display for TagConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagConflict::UniqueTagHeldElsewhere { holder } => {
                write!(f, "unique system tag already held by snapshot {holder}")
            }
            TagConflict::SystemSlotOccupied { tag_id, unique } => write!(
                f,
                "snapshot already holds {} system tag {tag_id}",
                if *unique { "unique" } else { "a" }
            ),
        }
    }
}

/// Outcome of the decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagDecision {
    /// Add the tag.
    Grant,
    /// Remove the tag from `holder`, then add it.
    StripHolderAndGrant {
        /// Snapshot losing the tag.
        holder: String,
    },
    /// Remove `previous` from the slot, then add the tag.
    ReplaceSlot {
        /// Tag leaving the slot.
        previous: String,
    },
    /// Both of the above.
    StripHolderAndReplaceSlot {
        /// Snapshot losing the tag.
        holder: String,
        /// Tag leaving the slot.
        previous: String,
    },
    /// Nothing is mutated.
    Reject(TagConflict),
}

/// Evaluate the exclusivity table.
///
/// | system | unique | holder | force | slot     | decision                     |
/// |--------|--------|--------|-------|----------|------------------------------|
/// | no     | *      | *      | *     | *        | grant                        |
/// | yes    | yes    | yes    | no    | *        | reject: held elsewhere       |
/// | yes    | *      | *      | no    | occupied | reject: slot occupied        |
/// | yes    | yes    | yes    | yes   | empty    | strip holder, grant          |
/// | yes    | yes    | yes    | yes   | occupied | strip holder, replace slot   |
/// | yes    | *      | no     | yes   | occupied | replace slot                 |
/// | yes    | *      | *      | *     | empty    | grant                        |
pub fn decide(request: &TagRequest) -> TagDecision {
    let holder = if request.system && request.unique {
        request.holder.clone()
    } else {
        None
    };
    let occupant = match &request.slot {
        SlotOccupant::Empty => None,
        SlotOccupant::Held { tag_id, unique } => Some((tag_id.clone(), *unique)),
    };

    match (request.system, holder, request.force, occupant) {
        (false, _, _, _) => TagDecision::Grant,
        (true, Some(holder), false, _) => {
            TagDecision::Reject(TagConflict::UniqueTagHeldElsewhere { holder })
        }
        (true, None, false, Some((tag_id, unique))) => {
            TagDecision::Reject(TagConflict::SystemSlotOccupied { tag_id, unique })
        }
        (true, Some(holder), true, None) => TagDecision::StripHolderAndGrant { holder },
        (true, Some(holder), true, Some((previous, _))) => {
            TagDecision::StripHolderAndReplaceSlot { holder, previous }
        }
        (true, None, true, Some((previous, _))) => TagDecision::ReplaceSlot { previous },
        (true, None, _, None) => TagDecision::Grant,
    }
}
