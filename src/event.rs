//! The event vocabulary emitted by the assistant runner and forwarded,
//! tagged by PRD name, onto the Manager's shared channel.

use std::collections::HashMap;

use serde_json::Value;

/// One event in a single PRD's loop. Every variant except the terminal ones
/// carries the iteration it was produced during.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    IterationStart {
        iteration: u32,
    },
    AssistantText {
        iteration: u32,
        text: String,
    },
    ToolStart {
        iteration: u32,
        tool: String,
        input: HashMap<String, Value>,
    },
    ToolResult {
        iteration: u32,
        text: String,
    },
    StoryStarted {
        iteration: u32,
        story_id: String,
    },
    /// The progress log changed on disk (the assistant, or an editor,
    /// appended/rewrote `progress.md`) outside of the runner's own stream.
    ProgressUpdated {
        iteration: u32,
        blocks: HashMap<String, Vec<String>>,
    },
    Retrying {
        iteration: u32,
        text: String,
    },
    MaxIterationsReached {
        iteration: u32,
    },
    Complete {
        iteration: u32,
    },
    Error {
        iteration: u32,
        err: String,
    },
}

impl Event {
    pub fn iteration(&self) -> u32 {
        match self {
            Event::IterationStart { iteration }
            | Event::AssistantText { iteration, .. }
            | Event::ToolStart { iteration, .. }
            | Event::ToolResult { iteration, .. }
            | Event::StoryStarted { iteration, .. }
            | Event::ProgressUpdated { iteration, .. }
            | Event::Retrying { iteration, .. }
            | Event::MaxIterationsReached { iteration }
            | Event::Complete { iteration }
            | Event::Error { iteration, .. } => *iteration,
        }
    }
}

/// An event tagged with the PRD name it came from, as delivered on the
/// Manager's fan-in channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub prd_name: String,
    pub event: Event,
}

/// Out-of-band result of a post-completion action (push/PR), delivered
/// separately from the `Event` stream so failures don't contaminate loop
/// state.
#[derive(Debug, Clone, PartialEq)]
pub enum PostCompletionResult {
    Pushed {
        prd_name: String,
        branch: String,
    },
    PushFailed {
        prd_name: String,
        err: String,
    },
    PullRequestCreated {
        prd_name: String,
        url: String,
    },
    PullRequestFailed {
        prd_name: String,
        err: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_accessor_covers_every_variant() {
        assert_eq!(Event::IterationStart { iteration: 1 }.iteration(), 1);
        assert_eq!(
            Event::AssistantText {
                iteration: 2,
                text: "hi".into()
            }
            .iteration(),
            2
        );
        assert_eq!(Event::Complete { iteration: 3 }.iteration(), 3);
        assert_eq!(
            Event::Error {
                iteration: 4,
                err: "boom".into()
            }
            .iteration(),
            4
        );
    }
}
