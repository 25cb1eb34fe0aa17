//! Board model.

use serde::{Deserialize, Serialize};

use crate::scope::scope_tag;

/// Column ids of a week board, Sunday first.
pub const WEEK_COLUMNS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A column of a `lists` board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub name: String,
}

impl Column {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Shape of a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BoardKind {
    /// Seven fixed day columns.
    Week,
    /// User-defined columns, replaced as a whole on merge.
    Lists { columns: Vec<Column> },
    /// Read-only aggregate of other boards, by local board id.
    Compound { children: Vec<String> },
    /// Scripture review board; carries no shared data.
    Bible,
}

impl BoardKind {
    /// Value of the `k` event tag.
    pub fn discriminator(&self) -> &'static str {
        match self {
            BoardKind::Week => "week",
            BoardKind::Lists { .. } => "lists",
            BoardKind::Compound { .. } => "compound",
            BoardKind::Bible => "bible",
        }
    }
}

/// Binding of a local board to a shared relay scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NostrBinding {
    /// Shared board id; every client of the scope knows it.
    pub board_id: String,
    /// Relays for this scope; empty means the configured defaults.
    #[serde(default)]
    pub relays: Vec<String>,
}

/// A board in the local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    /// Local id, unique within this replica.
    pub id: String,

    pub name: String,

    pub kind: BoardKind,

    /// Present when the board is shared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nostr: Option<NostrBinding>,

    #[serde(default)]
    pub clear_completed_disabled: bool,

    #[serde(default)]
    pub index_card_enabled: bool,

    /// Hidden from the board list (stub children of compound boards).
    #[serde(default)]
    pub hidden: bool,

    #[serde(default)]
    pub archived: bool,
}

impl Board {
    /// Create a local, unshared board.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: BoardKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            nostr: None,
            clear_completed_disabled: false,
            index_card_enabled: false,
            hidden: false,
            archived: false,
        }
    }

    /// Bind to a shared scope.
    pub fn shared(mut self, shared_board_id: impl Into<String>, relays: Vec<String>) -> Self {
        self.nostr = Some(NostrBinding {
            board_id: shared_board_id.into(),
            relays,
        });
        self
    }

    pub fn shared_id(&self) -> Option<&str> {
        self.nostr.as_ref().map(|binding| binding.board_id.as_str())
    }

    /// Scope tag of a shared board.
    pub fn scope_tag(&self) -> Option<String> {
        self.shared_id().map(scope_tag)
    }

    /// Column ids tasks may be placed in. Empty for compound and bible boards.
    pub fn column_ids(&self) -> Vec<String> {
        match &self.kind {
            BoardKind::Week => WEEK_COLUMNS.iter().map(|c| c.to_string()).collect(),
            BoardKind::Lists { columns } => columns.iter().map(|c| c.id.clone()).collect(),
            BoardKind::Compound { .. } | BoardKind::Bible => Vec::new(),
        }
    }
}
