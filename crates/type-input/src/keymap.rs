//! Keysym and layout resolution.
//!
//! Converts Unicode characters to xkb keysyms and keysyms to evdev key
//! codes plus the shift level they live on, using the keymap most recently
//! announced by the compositor.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use xkbcommon::xkb;

use crate::libei::InputError;

/// Offset between xkb keycodes and Linux evdev keycodes.
const EVDEV_OFFSET: u32 = 8;

/// Evdev keycodes used for modifiers and the compose sequence.
pub const KEY_LEFTCTRL: u32 = 29;
pub const KEY_LEFTSHIFT: u32 = 42;
pub const KEY_RIGHTALT: u32 = 100;
pub const KEY_U: u32 = 22;
pub const KEY_SPACE: u32 = 57;

/// An xkb keysym: the symbolic meaning of a key, independent of layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Keysym(u32);

impl Keysym {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Convert a character to its keysym.
///
/// Returns `None` for characters that have no keyboard representation
/// (Unicode noncharacters such as U+FFFF).
#[must_use]
pub fn keysym_for_char(ch: char) -> Option<Keysym> {
    let sym = xkb::utf32_to_keysym(u32::from(ch));
    if sym.raw() == xkb::keysyms::KEY_NoSymbol {
        None
    } else {
        Some(Keysym(sym.raw()))
    }
}

/// Where a keysym sits in the active layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMapping {
    /// Evdev keycode of the physical key.
    pub code: u32,
    /// Zero-based shift level. Levels above 3 cannot be typed.
    pub level: u32,
}

/// Modifier combination selecting one of the first four shift levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierLevel {
    Base,
    Shift,
    AltGr,
    ShiftAltGr,
}

impl ModifierLevel {
    /// Modifier keys to hold, in press order.
    #[must_use]
    pub const fn modifiers(self) -> &'static [u32] {
        match self {
            Self::Base => &[],
            Self::Shift => &[KEY_LEFTSHIFT],
            Self::AltGr => &[KEY_RIGHTALT],
            Self::ShiftAltGr => &[KEY_LEFTSHIFT, KEY_RIGHTALT],
        }
    }
}

impl TryFrom<u32> for ModifierLevel {
    type Error = u32;

    fn try_from(level: u32) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Base),
            1 => Ok(Self::Shift),
            2 => Ok(Self::AltGr),
            3 => Ok(Self::ShiftAltGr),
            other => Err(other),
        }
    }
}

/// Anything that can place a keysym on a physical key.
pub trait Layout {
    /// Find the key and level producing `keysym`, or `None` if no key in
    /// the layout produces it.
    fn lookup(&self, keysym: Keysym) -> Option<KeyMapping>;
}

/// Compiled snapshot of an xkb keymap: one keysym table per layout group.
#[derive(Debug, Clone, Default)]
pub struct LayoutTable {
    groups: Vec<HashMap<Keysym, KeyMapping>>,
}

impl LayoutTable {
    /// Compile an xkb text keymap (`XKB_KEYMAP_FORMAT_TEXT_V1`).
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Keymap`] if libxkbcommon rejects the keymap.
    pub fn from_xkb_text(text: String) -> Result<Self, InputError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_string(
            &context,
            text,
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or_else(|| InputError::Keymap("libxkbcommon failed to compile keymap".to_string()))?;
        Ok(Self::from_keymap(&keymap))
    }

    /// Scan every key of every layout. The lowest keycode wins, and
    /// within a key the lowest level.
    fn from_keymap(keymap: &xkb::Keymap) -> Self {
        let mut table = Self::default();
        let min = keymap.min_keycode().raw().max(EVDEV_OFFSET);
        let max = keymap.max_keycode().raw();

        for group in 0..keymap.num_layouts() {
            for raw in min..=max {
                let key = xkb::Keycode::new(raw);
                for level in 0..keymap.num_levels_for_key(key, group) {
                    for sym in keymap.key_get_syms_by_level(key, group, level) {
                        table.insert(
                            group,
                            Keysym(sym.raw()),
                            KeyMapping {
                                code: raw - EVDEV_OFFSET,
                                level,
                            },
                        );
                    }
                }
            }
        }

        tracing::debug!(
            groups = table.groups.len(),
            keysyms = table.groups.iter().map(HashMap::len).sum::<usize>(),
            "Compiled keymap"
        );
        table
    }

    /// Record `mapping` for `keysym` in `group` unless the keysym already
    /// has one there.
    pub fn insert(&mut self, group: u32, keysym: Keysym, mapping: KeyMapping) {
        let index = group as usize;
        if self.groups.len() <= index {
            self.groups.resize_with(index + 1, HashMap::new);
        }
        self.groups[index].entry(keysym).or_insert(mapping);
    }

    /// Number of layout groups in the keymap.
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Look up `keysym` in `group`, wrapping out-of-range groups.
    #[must_use]
    pub fn lookup_in_group(&self, group: u32, keysym: Keysym) -> Option<KeyMapping> {
        if self.groups.is_empty() {
            return None;
        }
        let index = group as usize % self.groups.len();
        self.groups[index].get(&keysym).copied()
    }
}

impl Layout for LayoutTable {
    fn lookup(&self, keysym: Keysym) -> Option<KeyMapping> {
        self.lookup_in_group(0, keysym)
    }
}

#[derive(Debug, Default)]
struct ActiveLayout {
    table: LayoutTable,
    group: u32,
}

/// Shared handle to the layout currently active on the compositor.
///
/// The input backend writes to it whenever a new keymap or modifier state
/// arrives; lookups always see the latest write.
#[derive(Debug, Clone, Default)]
pub struct LiveKeymap {
    inner: Arc<RwLock<ActiveLayout>>,
}

impl LiveKeymap {
    #[must_use]
    pub fn new(table: LayoutTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ActiveLayout { table, group: 0 })),
        }
    }

    /// Replace the keymap, e.g. after the user switched layouts.
    pub fn replace(&self, table: LayoutTable) {
        let mut active = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(groups = table.num_groups(), "Keymap replaced");
        active.table = table;
    }

    /// Set the effective layout group reported by the compositor.
    pub fn set_group(&self, group: u32) {
        let mut active = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if active.group != group {
            tracing::debug!(from = active.group, to = group, "Layout group changed");
            active.group = group;
        }
    }
}

impl Layout for LiveKeymap {
    fn lookup(&self, keysym: Keysym) -> Option<KeyMapping> {
        let active = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        active.table.lookup_in_group(active.group, keysym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Self-contained keymap: no includes, so no xkb data files are needed.
    const TEST_KEYMAP: &str = r#"xkb_keymap {
        xkb_keycodes "test" {
            minimum = 8;
            maximum = 255;
            <AE01> = 10;
            <AE02> = 11;
            <AC01> = 38;
            <AB02> = 53;
            <AB05> = 56;
            <SPCE> = 65;
            <KP1> = 87;
        };
        xkb_types "test" {
            type "ONE_LEVEL" {
                modifiers = none;
                level_name[Level1] = "Any";
            };
            type "TWO_LEVEL" {
                modifiers = Shift;
                map[Shift] = Level2;
                level_name[Level1] = "Base";
                level_name[Level2] = "Shift";
            };
        };
        xkb_compat "test" { };
        xkb_symbols "test" {
            key <AE01> { type = "TWO_LEVEL", [ 1, exclam ] };
            key <AE02> { type = "TWO_LEVEL", [ 2, x ] };
            key <AC01> {
                type = "TWO_LEVEL",
                symbols[Group1] = [ a, A ],
                symbols[Group2] = [ q, Q ]
            };
            key <AB02> { type = "TWO_LEVEL", [ x, X ] };
            key <AB05> { type = "TWO_LEVEL", [ b, B ] };
            key <SPCE> { type = "ONE_LEVEL", [ space ] };
            key <KP1> { type = "TWO_LEVEL", [ KP_End, 1 ] };
        };
    };"#;

    fn sym(ch: char) -> Keysym {
        keysym_for_char(ch).expect("character has a keysym")
    }

    #[test]
    fn latin_keysyms_match_codepoints() {
        assert_eq!(keysym_for_char('a'), Some(Keysym::new(0x61)));
        assert_eq!(keysym_for_char('A'), Some(Keysym::new(0x41)));
        assert_eq!(keysym_for_char('0'), Some(Keysym::new(0x30)));
    }

    #[test]
    fn noncharacters_have_no_keysym() {
        assert_eq!(keysym_for_char('\u{ffff}'), None);
        assert_eq!(keysym_for_char('\u{fdd0}'), None);
    }

    #[test]
    fn modifier_levels() {
        assert_eq!(ModifierLevel::try_from(0), Ok(ModifierLevel::Base));
        assert_eq!(ModifierLevel::try_from(3), Ok(ModifierLevel::ShiftAltGr));
        assert_eq!(ModifierLevel::try_from(4), Err(4));
        assert_eq!(
            ModifierLevel::ShiftAltGr.modifiers(),
            &[KEY_LEFTSHIFT, KEY_RIGHTALT]
        );
        assert!(ModifierLevel::Base.modifiers().is_empty());
    }

    #[test]
    fn first_mapping_wins() {
        let mut table = LayoutTable::default();
        table.insert(0, sym('1'), KeyMapping { code: 2, level: 0 });
        table.insert(0, sym('1'), KeyMapping { code: 79, level: 1 });
        assert_eq!(table.lookup(sym('1')), Some(KeyMapping { code: 2, level: 0 }));
        assert_eq!(table.lookup(sym('2')), None);
    }

    #[test]
    fn out_of_range_group_wraps() {
        let mut table = LayoutTable::default();
        table.insert(0, sym('a'), KeyMapping { code: 30, level: 0 });
        table.insert(1, sym('a'), KeyMapping { code: 16, level: 0 });
        assert_eq!(table.num_groups(), 2);
        assert_eq!(table.lookup_in_group(1, sym('a')).map(|m| m.code), Some(16));
        assert_eq!(table.lookup_in_group(2, sym('a')).map(|m| m.code), Some(30));
    }

    #[test]
    fn compiled_keymap_uses_evdev_codes_and_levels() {
        let table = LayoutTable::from_xkb_text(TEST_KEYMAP.to_string()).unwrap();
        assert_eq!(table.num_groups(), 2);
        assert_eq!(table.lookup(sym('A')), Some(KeyMapping { code: 30, level: 1 }));
        assert_eq!(table.lookup(sym('b')), Some(KeyMapping { code: 48, level: 0 }));
        assert_eq!(table.lookup(sym(' ')), Some(KeyMapping { code: 57, level: 0 }));
        assert_eq!(table.lookup(sym('!')), Some(KeyMapping { code: 2, level: 1 }));
    }

    #[test]
    fn compiled_keymap_prefers_lowest_keycode() {
        let table = LayoutTable::from_xkb_text(TEST_KEYMAP.to_string()).unwrap();
        // '1' is also the shifted symbol of the keypad End key.
        assert_eq!(table.lookup(sym('1')), Some(KeyMapping { code: 2, level: 0 }));
        // 'x' is shifted on a low key and unshifted on a higher one.
        assert_eq!(table.lookup(sym('x')), Some(KeyMapping { code: 3, level: 1 }));
    }

    #[test]
    fn compiled_keymap_keeps_groups_apart() {
        let table = LayoutTable::from_xkb_text(TEST_KEYMAP.to_string()).unwrap();
        assert_eq!(table.lookup_in_group(0, sym('q')), None);
        assert_eq!(
            table.lookup_in_group(1, sym('Q')),
            Some(KeyMapping { code: 30, level: 1 })
        );
    }

    #[test]
    fn empty_table_resolves_nothing() {
        let table = LayoutTable::default();
        assert_eq!(table.lookup_in_group(3, sym('a')), None);
    }

    #[test]
    fn live_keymap_sees_replacement_and_group() {
        let mut qwerty = LayoutTable::default();
        qwerty.insert(0, sym('z'), KeyMapping { code: 44, level: 0 });
        qwerty.insert(1, sym('z'), KeyMapping { code: 21, level: 0 });

        let live = LiveKeymap::new(qwerty);
        let reader = live.clone();
        assert_eq!(reader.lookup(sym('z')).map(|m| m.code), Some(44));

        live.set_group(1);
        assert_eq!(reader.lookup(sym('z')).map(|m| m.code), Some(21));

        let mut other = LayoutTable::default();
        other.insert(0, sym('y'), KeyMapping { code: 44, level: 0 });
        live.set_group(0);
        live.replace(other);
        assert_eq!(reader.lookup(sym('z')), None);
        assert_eq!(reader.lookup(sym('y')).map(|m| m.code), Some(44));
    }
}
