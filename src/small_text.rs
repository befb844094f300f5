// Short labels for windows, images and glyph resources.
//
// Most labels fit in a couple of machine words, so they are stored inline and
// only spill to the heap when longer than INLINE_CAPACITY bytes.

use std::fmt;
use std::ops::Deref;

pub const INLINE_CAPACITY: usize = 22;

#[derive(Clone)]
pub struct SmallText(Repr);

// `len` never exceeds INLINE_CAPACITY and always ends on a char boundary
#[derive(Clone)]
enum Repr {
    Inline { len: u8, bytes: [u8; INLINE_CAPACITY] },
    Heap(Box<str>),
}

impl SmallText {
    pub fn new(text: &str) -> Self {
        if text.len() <= INLINE_CAPACITY {
            let mut bytes = [0u8; INLINE_CAPACITY];
            bytes[..text.len()].copy_from_slice(text.as_bytes());
            SmallText(Repr::Inline {
                len: text.len() as u8,
                bytes,
            })
        } else {
            SmallText(Repr::Heap(text.into()))
        }
    }

    pub fn as_str(&self) -> &str {
        match &self.0 {
            Repr::Inline { len, bytes } => {
                std::str::from_utf8(&bytes[..*len as usize]).unwrap_or_default()
            }
            Repr::Heap(text) => text,
        }
    }
}

impl Default for SmallText {
    fn default() -> Self {
        SmallText::new("")
    }
}

impl Deref for SmallText {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for SmallText {
    fn from(text: &str) -> Self {
        SmallText::new(text)
    }
}

impl From<String> for SmallText {
    fn from(text: String) -> Self {
        if text.len() <= INLINE_CAPACITY {
            SmallText::new(&text)
        } else {
            SmallText(Repr::Heap(text.into_boxed_str()))
        }
    }
}

impl PartialEq for SmallText {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for SmallText {}

impl std::hash::Hash for SmallText {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for SmallText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for SmallText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_inline(text: &SmallText) -> bool {
        matches!(text.0, Repr::Inline { .. })
    }

    #[test]
    fn short_labels_stay_inline() {
        let text = SmallText::new("main window");
        assert!(is_inline(&text));
        assert_eq!(text.as_str(), "main window");
    }

    #[test]
    fn inline_capacity_is_the_boundary() {
        let exact = "a".repeat(INLINE_CAPACITY);
        let over = "a".repeat(INLINE_CAPACITY + 1);
        assert!(is_inline(&SmallText::new(&exact)));
        assert!(!is_inline(&SmallText::new(&over)));
        assert_eq!(SmallText::from(over.clone()).as_str(), over);
    }

    #[test]
    fn multibyte_text_round_trips() {
        let text = SmallText::from("ünïcødé ✓");
        assert_eq!(&*text, "ünïcødé ✓");
    }

    #[test]
    fn equality_ignores_representation() {
        let long = "x".repeat(INLINE_CAPACITY);
        let inline = SmallText::new(&long);
        let heap = SmallText(Repr::Heap(long.into_boxed_str()));
        assert_eq!(inline, heap);
    }
}
