//! Kernel filter rules (`struct audit_rule_data`).
//!
//! A [`Rule`] starts life as a directory watch and is then amended with
//! permission and field predicates before being handed to
//! [`AuditClient::add_rule`](crate::client::AuditClient::add_rule), which
//! consumes it.

use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use bitflags::bitflags;
use nix::unistd::{Group, User};
use serde::Deserialize;

/// Capacity of the parallel field arrays.
pub const AUDIT_MAX_FIELDS: usize = 64;
/// Number of u32 words in the syscall mask.
pub const AUDIT_BITMASK_SIZE: usize = 64;
/// Encoded size of the fixed part of a rule, before the inline buffer.
pub const RULE_FIXED_LEN: usize = 4 * (3 + AUDIT_BITMASK_SIZE + 3 * AUDIT_MAX_FIELDS + 1);

/// Apply the rule at syscall exit.
pub const AUDIT_FILTER_EXIT: u32 = 0x04;
/// Always generate a record when the rule matches.
pub const AUDIT_ALWAYS: u32 = 2;

// ---------------------------------------------------------------------------
// Fields and operators
// ---------------------------------------------------------------------------

/// Rule field identifiers understood by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Field {
    Pid = 0,
    Uid = 1,
    Euid = 2,
    Suid = 3,
    Fsuid = 4,
    Gid = 5,
    Egid = 6,
    Sgid = 7,
    Fsgid = 8,
    LoginUid = 9,
    Pers = 10,
    Arch = 11,
    MsgType = 12,
    Success = 104,
    Watch = 105,
    Perm = 106,
    Dir = 107,
}

impl Field {
    const ALL: [Field; 17] = [
        Field::Pid,
        Field::Uid,
        Field::Euid,
        Field::Suid,
        Field::Fsuid,
        Field::Gid,
        Field::Egid,
        Field::Sgid,
        Field::Fsgid,
        Field::LoginUid,
        Field::Pers,
        Field::Arch,
        Field::MsgType,
        Field::Success,
        Field::Watch,
        Field::Perm,
        Field::Dir,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Pid => "pid",
            Field::Uid => "uid",
            Field::Euid => "euid",
            Field::Suid => "suid",
            Field::Fsuid => "fsuid",
            Field::Gid => "gid",
            Field::Egid => "egid",
            Field::Sgid => "sgid",
            Field::Fsgid => "fsgid",
            Field::LoginUid => "loginuid",
            Field::Pers => "pers",
            Field::Arch => "arch",
            Field::MsgType => "msgtype",
            Field::Success => "success",
            Field::Watch => "watch",
            Field::Perm => "perm",
            Field::Dir => "dir",
        }
    }

    fn is_user(self) -> bool {
        matches!(
            self,
            Field::Uid | Field::Euid | Field::Suid | Field::Fsuid | Field::LoginUid
        )
    }

    fn is_group(self) -> bool {
        matches!(self, Field::Gid | Field::Egid | Field::Sgid | Field::Fsgid)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied between a field and its value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[serde(rename = "&")]
    BitMask,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "!=")]
    NotEqual,
    #[default]
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "&=")]
    BitTest,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    pub fn bits(self) -> u32 {
        match self {
            Operator::BitMask => 0x0800_0000,
            Operator::Lt => 0x1000_0000,
            Operator::Gt => 0x2000_0000,
            Operator::NotEqual => 0x3000_0000,
            Operator::Equal => 0x4000_0000,
            Operator::BitTest => 0x4800_0000,
            Operator::Le => 0x5000_0000,
            Operator::Ge => 0x6000_0000,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        [
            Operator::BitMask,
            Operator::Lt,
            Operator::Gt,
            Operator::NotEqual,
            Operator::Equal,
            Operator::BitTest,
            Operator::Le,
            Operator::Ge,
        ]
        .into_iter()
        .find(|op| op.bits() == bits)
    }
}

bitflags! {
    /// Access kinds a watch reports on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        const EXEC = 0x1;
        const WRITE = 0x2;
        const READ = 0x4;
        const ATTR = 0x8;
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule already holds the maximum of 64 fields")]
    TooManyFields,

    #[error("unknown {kind} {name:?}")]
    UnknownPrincipal { kind: &'static str, name: String },

    #[error("invalid value {value:?} for field {field}")]
    InvalidValue { field: Field, value: String },

    #[error("unsupported rule field: {0}")]
    UnsupportedField(Field),
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// One predicate of a rule, as read back from the field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleField {
    pub field: Field,
    pub operator: Operator,
    pub value: u32,
}

/// `struct audit_rule_data` with its inline path buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Rule {
    flags: u32,
    action: u32,
    field_count: usize,
    mask: [u32; AUDIT_BITMASK_SIZE],
    fields: [u32; AUDIT_MAX_FIELDS],
    values: [u32; AUDIT_MAX_FIELDS],
    fieldflags: [u32; AUDIT_MAX_FIELDS],
    buf: Vec<u8>,
}

impl Rule {
    /// A syscall-exit rule that fires on every access to `path`.
    ///
    /// The rule carries two fields: `dir = path` and
    /// `perm = read|write|exec|attr`.
    pub fn directory_watch(path: impl AsRef<Path>) -> Self {
        let buf = path.as_ref().as_os_str().as_bytes().to_vec();
        let mut rule = Self {
            flags: AUDIT_FILTER_EXIT,
            action: AUDIT_ALWAYS,
            field_count: 0,
            mask: [0; AUDIT_BITMASK_SIZE],
            fields: [0; AUDIT_MAX_FIELDS],
            values: [0; AUDIT_MAX_FIELDS],
            fieldflags: [0; AUDIT_MAX_FIELDS],
            buf,
        };

        rule.mask[0] = !0;
        rule.push(Field::Dir, Operator::Equal, rule.buf.len() as u32);
        rule.mask[1] = !0;
        rule.push(Field::Perm, Operator::Equal, Permissions::all().bits());
        rule
    }

    /// Replace the permission filter, appending one if the rule has none.
    pub fn set_permissions(&mut self, permissions: Permissions) -> Result<(), RuleError> {
        if let Some(i) = self.position(Field::Perm) {
            self.values[i] = permissions.bits();
            return Ok(());
        }
        self.ensure_capacity()?;
        self.push(Field::Perm, Operator::Equal, permissions.bits());
        Ok(())
    }

    /// Append `field operator value`.
    ///
    /// Identity fields take a numeral or an account/group name. The success
    /// field only takes `"0"` or `"1"`.
    pub fn add_field(
        &mut self,
        field: Field,
        operator: Operator,
        value: &str,
    ) -> Result<(), RuleError> {
        self.ensure_capacity()?;

        let invalid = || RuleError::InvalidValue {
            field,
            value: value.to_string(),
        };
        let starts_with_digit = value.bytes().next().is_some_and(|b| b.is_ascii_digit());

        let resolved = if field.is_user() {
            if starts_with_digit {
                parse_numeral(value).ok_or_else(invalid)?
            } else {
                lookup_user(value)?
            }
        } else if field.is_group() {
            if starts_with_digit {
                parse_numeral(value).ok_or_else(invalid)?
            } else {
                lookup_group(value)?
            }
        } else if field == Field::Success {
            match value {
                "0" => 0,
                "1" => 1,
                _ => return Err(invalid()),
            }
        } else {
            return Err(RuleError::UnsupportedField(field));
        };

        self.push(field, operator, resolved);
        Ok(())
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// The rule's predicates in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = RuleField> + '_ {
        (0..self.field_count).filter_map(|i| {
            Some(RuleField {
                field: Field::from_id(self.fields[i])?,
                operator: Operator::from_bits(self.fieldflags[i])?,
                value: self.values[i],
            })
        })
    }

    /// The watched path held in the inline buffer.
    pub fn path(&self) -> &Path {
        Path::new(std::ffi::OsStr::from_bytes(&self.buf))
    }

    /// Encode in the kernel's `audit_rule_data` layout, inline buffer last.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RULE_FIXED_LEN + self.buf.len());
        let mut put = |word: u32| out.extend_from_slice(&word.to_ne_bytes());

        put(self.flags);
        put(self.action);
        put(self.field_count as u32);
        self.mask.iter().copied().for_each(&mut put);
        self.fields.iter().copied().for_each(&mut put);
        self.values.iter().copied().for_each(&mut put);
        self.fieldflags.iter().copied().for_each(&mut put);
        put(self.buf.len() as u32);

        out.extend_from_slice(&self.buf);
        out
    }

    fn position(&self, field: Field) -> Option<usize> {
        self.fields[..self.field_count]
            .iter()
            .position(|&id| id == field.id())
    }

    fn ensure_capacity(&self) -> Result<(), RuleError> {
        if self.field_count >= AUDIT_MAX_FIELDS {
            return Err(RuleError::TooManyFields);
        }
        Ok(())
    }

    fn push(&mut self, field: Field, operator: Operator, value: u32) {
        let i = self.field_count;
        self.fields[i] = field.id();
        self.fieldflags[i] = operator.bits();
        self.values[i] = value;
        self.field_count += 1;
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("flags", &self.flags)
            .field("action", &self.action)
            .field("path", &self.path())
            .field("fields", &self.fields().collect::<Vec<_>>())
            .finish()
    }
}

/// Unsigned numeral with C-style radix prefix: `0x` hex, leading `0` octal.
fn parse_numeral(text: &str) -> Option<u32> {
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    // from_str_radix tolerates a sign; a numeral here is digits only.
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}

fn lookup_user(name: &str) -> Result<u32, RuleError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(RuleError::UnknownPrincipal {
            kind: "user",
            name: name.to_string(),
        }),
    }
}

fn lookup_group(name: &str) -> Result<u32, RuleError> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        _ => Err(RuleError::UnknownPrincipal {
            kind: "group",
            name: name.to_string(),
        }),
    }
}
