//! Pointer and keyboard events, and the key bindings that turn them into actions.

use kurbo::Point;
use serde::{Deserialize, Serialize};

/// Modifier keys state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub shift: bool,
    pub ctrl: bool,
    pub alt: bool,
    pub meta: bool,
}

impl Modifiers {
    /// Ctrl on most platforms, Cmd on macOS.
    pub fn command(&self) -> bool {
        self.ctrl || self.meta
    }
}

/// Pointer event in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PointerEvent {
    Down { position: Point, modifiers: Modifiers },
    Move { position: Point },
    Up { position: Point },
    /// The pointer left the canvas.
    Leave,
}

impl PointerEvent {
    pub fn position(&self) -> Option<Point> {
        match self {
            PointerEvent::Down { position, .. }
            | PointerEvent::Move { position }
            | PointerEvent::Up { position } => Some(*position),
            PointerEvent::Leave => None,
        }
    }
}

/// A key press. `key` follows the DOM `KeyboardEvent.key` naming
/// ("a", "Delete", "Escape", "/").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    pub key: String,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyEvent {
    pub fn new(key: impl Into<String>, modifiers: Modifiers) -> Self {
        Self {
            key: key.into(),
            modifiers,
        }
    }

    pub fn plain(key: impl Into<String>) -> Self {
        Self::new(key, Modifiers::default())
    }

    pub fn with_command(key: impl Into<String>) -> Self {
        Self::new(
            key,
            Modifiers {
                ctrl: true,
                ..Modifiers::default()
            },
        )
    }
}

/// Editor commands bound to keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    DeleteSelection,
    Undo,
    Redo,
    Copy,
    Paste,
    SelectAll,
    /// Open the chat bubble on the cursor.
    StartChat,
    /// Open the reaction picker.
    OpenReactions,
    /// Cancel the current interaction or hide the cursor mode.
    Escape,
}

impl Action {
    /// Look up the binding for a key press.
    pub fn from_key(event: &KeyEvent) -> Option<Action> {
        let mods = event.modifiers;
        let key = event.key.as_str();
        if mods.command() {
            return match key.to_ascii_lowercase().as_str() {
                "z" if mods.shift => Some(Action::Redo),
                "z" => Some(Action::Undo),
                "y" => Some(Action::Redo),
                "c" => Some(Action::Copy),
                "v" => Some(Action::Paste),
                "a" => Some(Action::SelectAll),
                _ => None,
            };
        }
        match key {
            "Delete" | "Backspace" => Some(Action::DeleteSelection),
            "Escape" => Some(Action::Escape),
            "/" => Some(Action::StartChat),
            "e" | "E" if !mods.alt => Some(Action::OpenReactions),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undo_redo_bindings() {
        assert_eq!(Action::from_key(&KeyEvent::with_command("z")), Some(Action::Undo));
        let shift_z = KeyEvent::new(
            "Z",
            Modifiers {
                ctrl: true,
                shift: true,
                ..Modifiers::default()
            },
        );
        assert_eq!(Action::from_key(&shift_z), Some(Action::Redo));
        assert_eq!(Action::from_key(&KeyEvent::with_command("y")), Some(Action::Redo));
    }

    #[test]
    fn test_meta_counts_as_command() {
        let cmd_c = KeyEvent::new(
            "c",
            Modifiers {
                meta: true,
                ..Modifiers::default()
            },
        );
        assert_eq!(Action::from_key(&cmd_c), Some(Action::Copy));
    }

    #[test]
    fn test_plain_bindings() {
        assert_eq!(Action::from_key(&KeyEvent::plain("Delete")), Some(Action::DeleteSelection));
        assert_eq!(Action::from_key(&KeyEvent::plain("Backspace")), Some(Action::DeleteSelection));
        assert_eq!(Action::from_key(&KeyEvent::plain("/")), Some(Action::StartChat));
        assert_eq!(Action::from_key(&KeyEvent::plain("e")), Some(Action::OpenReactions));
        assert_eq!(Action::from_key(&KeyEvent::plain("Escape")), Some(Action::Escape));
        assert_eq!(Action::from_key(&KeyEvent::plain("q")), None);
    }

    #[test]
    fn test_pointer_position() {
        let p = Point::new(3.0, 4.0);
        assert_eq!(PointerEvent::Move { position: p }.position(), Some(p));
        assert_eq!(PointerEvent::Leave.position(), None);
    }
}
