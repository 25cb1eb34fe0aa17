//! Board merge engine.
//!
//! Folds an admitted scope-metadata event into the local board arena.
//! Boards are stored by local id and compound children refer to each other
//! by local id only, so cycles cost nothing and a board can never embed
//! itself.

use std::collections::BTreeMap;
use tracing::debug;

use crate::models::{Board, BoardKind, NostrBinding};
use crate::payload::ScopeMetadataV1;

/// Decoded scope-metadata event.
#[derive(Debug, Clone)]
pub struct BoardUpdate {
    /// `k` tag.
    pub kind: Option<String>,
    /// `name` tag.
    pub name: Option<String>,
    pub payload: ScopeMetadataV1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardMerge {
    Updated {
        /// Stub boards created for unknown compound children.
        stubs: Vec<String>,
    },
    /// The kind has no merge rule (bible boards).
    NoMergeRule,
    /// No local board with that id.
    Missing,
}

/// Apply `update` to the board `board_id` in `boards`.
pub fn merge_board(
    boards: &mut BTreeMap<String, Board>,
    board_id: &str,
    update: BoardUpdate,
) -> BoardMerge {
    let Some(local) = boards.get(board_id).cloned() else {
        return BoardMerge::Missing;
    };
    let BoardUpdate {
        kind,
        name,
        payload,
    } = update;

    let mut stubs = Vec::new();
    let kind = match kind.as_deref() {
        Some("week") => BoardKind::Week,
        Some("lists") => {
            let columns = match (payload.columns, &local.kind) {
                (Some(columns), _) => columns,
                (None, BoardKind::Lists { columns }) => columns.clone(),
                (None, _) => Vec::new(),
            };
            BoardKind::Lists { columns }
        }
        Some("compound") => {
            let children = match (payload.children, &local.kind) {
                (Some(refs), _) => normalize_children(boards, &local, &refs, &mut stubs),
                (None, BoardKind::Compound { children }) => children.clone(),
                (None, _) => Vec::new(),
            };
            BoardKind::Compound { children }
        }
        Some("bible") => return BoardMerge::NoMergeRule,
        other => {
            if let Some(unknown) = other {
                debug!("Board {} has unknown kind {:?}, keeping local kind", board_id, unknown);
            }
            local.kind.clone()
        }
    };

    let mut merged = local;
    merged.kind = kind;
    if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
        merged.name = name;
    }
    if let Some(flag) = payload.clear_completed_disabled {
        merged.clear_completed_disabled = flag;
    }
    if let Some(flag) = payload.index_card_enabled {
        merged.index_card_enabled = flag;
    }
    boards.insert(board_id.to_string(), merged);

    BoardMerge::Updated { stubs }
}

/// Resolve shared child ids to local board ids, creating hidden stubs for
/// children this replica has not seen yet.
fn normalize_children(
    boards: &mut BTreeMap<String, Board>,
    parent: &Board,
    refs: &[String],
    stubs: &mut Vec<String>,
) -> Vec<String> {
    let parent_relays = parent
        .nostr
        .as_ref()
        .map(|binding| binding.relays.clone())
        .unwrap_or_default();

    let mut children: Vec<String> = Vec::with_capacity(refs.len());
    for reference in refs {
        let reference = reference.trim();
        if reference.is_empty() {
            continue;
        }
        if reference == parent.id || Some(reference) == parent.shared_id() {
            debug!("Compound board {} lists itself, skipping", parent.id);
            continue;
        }

        let local_id = match resolve(boards, reference) {
            Some(id) => id,
            None => {
                let id = unused_id(boards, reference);
                let mut stub = Board::new(id.clone(), reference, BoardKind::Lists { columns: Vec::new() });
                stub.nostr = Some(NostrBinding {
                    board_id: reference.to_string(),
                    relays: parent_relays.clone(),
                });
                stub.hidden = true;
                stub.archived = true;
                boards.insert(id.clone(), stub);
                stubs.push(id.clone());
                id
            }
        };

        if local_id != parent.id && !children.contains(&local_id) {
            children.push(local_id);
        }
    }
    children
}

/// Local id of the board bound to `shared_id`, or a local board with that id.
fn resolve(boards: &BTreeMap<String, Board>, shared_id: &str) -> Option<String> {
    boards
        .values()
        .find(|board| board.shared_id() == Some(shared_id))
        .or_else(|| boards.get(shared_id))
        .map(|board| board.id.clone())
}

fn unused_id(boards: &BTreeMap<String, Board>, wanted: &str) -> String {
    if !boards.contains_key(wanted) {
        return wanted.to_string();
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}", wanted, n);
        if !boards.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;

    fn arena(boards: Vec<Board>) -> BTreeMap<String, Board> {
        boards.into_iter().map(|b| (b.id.clone(), b)).collect()
    }

    fn update(kind: Option<&str>, payload: ScopeMetadataV1) -> BoardUpdate {
        BoardUpdate {
            kind: kind.map(str::to_string),
            name: Some("Renamed".into()),
            payload,
        }
    }

    #[test]
    fn lists_columns_replace_whole_array() {
        let local = Board::new(
            "b",
            "Old",
            BoardKind::Lists {
                columns: vec![Column::new("a", "A"), Column::new("b", "B")],
            },
        );
        let mut boards = arena(vec![local]);
        let payload = ScopeMetadataV1 {
            columns: Some(vec![Column::new("c", "C")]),
            ..Default::default()
        };
        merge_board(&mut boards, "b", update(Some("lists"), payload));
        assert_eq!(
            boards["b"].kind,
            BoardKind::Lists {
                columns: vec![Column::new("c", "C")]
            }
        );
        assert_eq!(boards["b"].name, "Renamed");
    }

    #[test]
    fn unknown_kind_keeps_local_kind_and_updates_flags() {
        let local = Board::new("b", "Old", BoardKind::Week);
        let mut boards = arena(vec![local]);
        let payload = ScopeMetadataV1 {
            clear_completed_disabled: Some(true),
            index_card_enabled: Some(true),
            ..Default::default()
        };
        let outcome = merge_board(&mut boards, "b", update(None, payload.clone()));
        assert_eq!(outcome, BoardMerge::Updated { stubs: vec![] });
        assert_eq!(boards["b"].kind, BoardKind::Week);
        assert!(boards["b"].clear_completed_disabled);
        assert!(boards["b"].index_card_enabled);

        merge_board(&mut boards, "b", update(Some("kanban"), payload));
        assert_eq!(boards["b"].kind, BoardKind::Week);
    }

    #[test]
    fn compound_children_resolve_and_stub() {
        let known = Board::new("local-a", "A", BoardKind::Week).shared("shared-a", vec![]);
        let parent = Board::new("c", "All", BoardKind::Compound { children: vec![] })
            .shared("shared-c", vec!["wss://relay.example".into()]);
        let mut boards = arena(vec![known, parent]);

        let payload = ScopeMetadataV1 {
            children: Some(vec![
                "shared-a".into(),
                "shared-b".into(),
                "shared-a".into(),
                "shared-c".into(),
                " ".into(),
            ]),
            ..Default::default()
        };
        let outcome = merge_board(&mut boards, "c", update(Some("compound"), payload));
        assert_eq!(
            outcome,
            BoardMerge::Updated {
                stubs: vec!["shared-b".into()]
            }
        );
        assert_eq!(
            boards["c"].kind,
            BoardKind::Compound {
                children: vec!["local-a".into(), "shared-b".into()]
            }
        );

        let stub = &boards["shared-b"];
        assert!(stub.hidden && stub.archived);
        assert_eq!(stub.shared_id(), Some("shared-b"));
        assert_eq!(stub.nostr.as_ref().unwrap().relays, vec!["wss://relay.example"]);
    }

    #[test]
    fn stub_id_avoids_collisions() {
        let unrelated = Board::new("shared-b", "Local", BoardKind::Week).shared("other", vec![]);
        let parent = Board::new("c", "All", BoardKind::Compound { children: vec![] });
        let mut boards = arena(vec![unrelated, parent]);
        // "shared-b" exists as a local id, so it resolves to it directly.
        let payload = ScopeMetadataV1 {
            children: Some(vec!["shared-b".into(), "shared-x".into()]),
            ..Default::default()
        };
        merge_board(&mut boards, "c", update(Some("compound"), payload));
        assert_eq!(
            boards["c"].kind,
            BoardKind::Compound {
                children: vec!["shared-b".into(), "shared-x".into()]
            }
        );
        assert_eq!(unused_id(&boards, "shared-x"), "shared-x-1");
    }

    #[test]
    fn bible_has_no_merge_rule() {
        let mut boards = arena(vec![Board::new("b", "Verses", BoardKind::Bible)]);
        let outcome = merge_board(&mut boards, "b", update(Some("bible"), Default::default()));
        assert_eq!(outcome, BoardMerge::NoMergeRule);
        assert_eq!(boards["b"].name, "Verses");
    }

    #[test]
    fn missing_board() {
        let mut boards = BTreeMap::new();
        assert_eq!(
            merge_board(&mut boards, "nope", update(Some("week"), Default::default())),
            BoardMerge::Missing
        );
    }
}
