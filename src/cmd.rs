//! Command data model (spec §3) and the classification C6 routes on.
//!
//! The full generated command surface (hundreds of per-command wrappers) is
//! out of scope (spec §1); callers build a [`Command`] directly or via the
//! small set of constructors here, and classify it by passing a
//! [`CommandKind`] — in a complete deployment this classification is produced
//! by the generated command layer, which is the external collaborator this
//! core consumes (spec §1's "consumes from them only the interfaces defined
//! in §6").

/// Classification used by the router (C6) to pick a default [`crate::router::Route`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A single key argument determines routing (e.g. `GET`, `SET`).
    SingleKey,
    /// Multiple keys that must all resolve to the same slot (e.g. transactions'
    /// multi-key commands, `RENAME`).
    MultiKeySameSlot,
    /// Multiple keys that may span slots and must be split (e.g. `MGET`, `MSET`).
    MultiSlotPattern(MultiKeyPattern),
    AllPrimaries,
    AllNodes,
    Random,
    Admin,
}

/// The argument layout used to split a [`CommandKind::MultiSlotPattern`]
/// command into per-slot sub-commands (spec §4.6 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiKeyPattern {
    /// Each arg after the command name is a key (`MGET k1 k2 k3`).
    KeysOnly,
    /// Alternating key, value (`MSET k1 v1 k2 v2`).
    KeyValuePairs,
    /// Keys, then one shared suffix repeated per group (`JSON.MGET k1 k2 path`).
    KeysAndLastArg,
    /// Triples `(key, arg, arg)` (`JSON.MSET k1 p1 v1 k2 p2 v2`).
    KeyWithTwoArgTriples,
}

/// The response-aggregation policy the router records for a fanned-out
/// command (spec §4.6), shared by the batch executor (C8) and the public
/// handle (C9) when folding sub-results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePolicy {
    OneSucceeded,
    FirstSucceededNonEmptyOrAllEmpty,
    AllSucceeded,
    CombineArrays,
    CombineMaps,
    AggregateLogicalAnd,
    AggregateMin,
    AggregateSum,
    Special,
}

/// One RESP command: an opaque kind plus binary-safe argument vector.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub args: Vec<Vec<u8>>,
    /// Whether this command is safe to retry on a fresh connection after a
    /// transport error (spec §4.7: "Non-retry-safe commands fail with
    /// `Disconnect`"). Idempotent-by-classification commands default to
    /// `true`; the caller may override for a write command it knows is safe
    /// to repeat (e.g. because it carries its own idempotency key).
    pub retry_safe: bool,
    /// Designated blocking commands (e.g. `BLPOP`) register without a
    /// deadline in C3 (spec §4.3).
    pub blocking: bool,
    /// How to fold per-slot sub-replies back into one logical reply, for a
    /// [`CommandKind::MultiSlotPattern`] or [`CommandKind::AllPrimaries`]/
    /// [`CommandKind::AllNodes`] command that actually fans out to more than
    /// one node. Left to the caller because the correct policy is a property
    /// of the specific command name (`MGET` combines arrays, `MSET` wants
    /// every part to succeed), which this core does not know — that mapping
    /// lives in the generated command layer (spec §1's external
    /// collaborator). `None` means the command is never expected to fan out
    /// to more than one node at a time.
    pub response_policy: Option<ResponsePolicy>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Command {
            kind,
            args: Vec::new(),
            retry_safe: matches!(
                kind,
                CommandKind::SingleKey
                    | CommandKind::MultiKeySameSlot
                    | CommandKind::MultiSlotPattern(_)
                    | CommandKind::AllPrimaries
                    | CommandKind::AllNodes
                    | CommandKind::Random
                    | CommandKind::Admin
            ),
            blocking: false,
            response_policy: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn retry_safe(mut self, value: bool) -> Self {
        self.retry_safe = value;
        self
    }

    pub fn blocking(mut self, value: bool) -> Self {
        self.blocking = value;
        self
    }

    pub fn response_policy(mut self, policy: ResponsePolicy) -> Self {
        self.response_policy = Some(policy);
        self
    }

    /// The policy to use when this command's routing produced more than one
    /// sub-reply: the caller's explicit choice, or `CombineArrays` as a
    /// generic default for `MultiSlotPattern` commands (correct for the
    /// common `MGET`-shaped case; a command with different fan-out semantics
    /// should set `response_policy` explicitly).
    pub fn effective_response_policy(&self) -> ResponsePolicy {
        self.response_policy.unwrap_or(match self.kind {
            CommandKind::AllPrimaries | CommandKind::AllNodes => ResponsePolicy::AllSucceeded,
            _ => ResponsePolicy::CombineArrays,
        })
    }

    /// The first argument after the command name, used by the router as the
    /// routing key for `SingleKey`/`MultiKeySameSlot` commands.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.args.get(1).map(|v| v.as_slice())
    }

    /// All argument positions the router should treat as keys, given this
    /// command's pattern. Positions are indices into `args` (0 is the command
    /// name itself, so keys start at 1).
    pub fn key_positions(&self) -> Vec<usize> {
        match self.kind {
            CommandKind::SingleKey | CommandKind::MultiKeySameSlot => {
                if self.args.len() > 1 {
                    vec![1]
                } else {
                    vec![]
                }
            }
            CommandKind::MultiSlotPattern(pattern) => match pattern {
                MultiKeyPattern::KeysOnly => (1..self.args.len()).collect(),
                MultiKeyPattern::KeyValuePairs => (1..self.args.len()).step_by(2).collect(),
                MultiKeyPattern::KeysAndLastArg => (1..self.args.len().saturating_sub(1)).collect(),
                MultiKeyPattern::KeyWithTwoArgTriples => (1..self.args.len()).step_by(3).collect(),
            },
            _ => vec![],
        }
    }

    pub fn name(&self) -> &[u8] {
        self.args.first().map(|v| v.as_slice()).unwrap_or(b"")
    }
}
