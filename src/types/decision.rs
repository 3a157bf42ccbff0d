use std::fmt;

/// A queuing-discipline class reference: qdisc number and class number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassRef {
    pub qdisc: u32,
    pub class: u32,
}

impl ClassRef {
    #[must_use]
    pub const fn new(qdisc: u32, class: u32) -> ClassRef {
        ClassRef { qdisc, class }
    }
}

impl fmt::Display for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.qdisc, self.class)
    }
}

/// A terminal classification outcome. Decisions are the only nodes with
/// observable external meaning after compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// No decision; classification continues with whatever follows.
    Continue,
    /// Select a class.
    Class(ClassRef),
    /// Drop the packet.
    Drop,
    /// Restart classification at the given class.
    Reclassify(ClassRef),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Continue => write!(f, "unspec"),
            Decision::Class(c) => write!(f, "class {c}"),
            Decision::Drop => write!(f, "drop"),
            Decision::Reclassify(c) => write!(f, "reclassify {c}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(Decision::Continue.to_string(), "unspec");
        assert_eq!(Decision::Drop.to_string(), "drop");
        assert_eq!(
            Decision::Class(ClassRef::new(1, 2)).to_string(),
            "class 1:2"
        );
        assert_eq!(
            Decision::Reclassify(ClassRef::new(1, 2)).to_string(),
            "reclassify 1:2"
        );
    }
}
