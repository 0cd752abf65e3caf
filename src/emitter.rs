//! The output sink a cell run accumulates into. Owned transiently by the
//! execution loop for the duration of one `execute` call and handed
//! (by reference, via `Rc<RefCell<..>>`) to the console proxy and the
//! `@nodebooks/ui` display hook so both can append without knowing about
//! each other. `onStream`/`onDisplay` fire synchronously with the
//! corresponding append, preserving output ordering.

use crate::output::{DisplayOutput, NotebookOutput, StreamName};
use std::collections::BTreeMap;
use std::rc::Rc;

type StreamHook<'a> = Box<dyn FnMut(&StreamName, &str) + 'a>;
type DisplayHook<'a> = Box<dyn FnMut(&DisplayOutput) + 'a>;

pub struct OutputSink<'a> {
    pub outputs: Vec<NotebookOutput>,
    on_stream: Option<StreamHook<'a>>,
    on_display: Option<DisplayHook<'a>>,
}

impl<'a> OutputSink<'a> {
    pub fn new(on_stream: Option<StreamHook<'a>>, on_display: Option<DisplayHook<'a>>) -> Self {
        OutputSink {
            outputs: Vec::new(),
            on_stream,
            on_display,
        }
    }

    /// Appends a `stream` output, firing `onStream` first.
    pub fn push_stream(&mut self, name: StreamName, text: impl Into<String>) {
        let text = text.into();
        if let Some(hook) = self.on_stream.as_mut() {
            hook(&name, &text);
        }
        self.outputs.push(NotebookOutput::stream(name, text));
    }

    /// Appends a `display_data` output. When `streamed` is true, `onDisplay`
    /// fires synchronously with the append; the terminal (non-streamed)
    /// display never triggers `onDisplay`.
    pub fn push_display(&mut self, data: BTreeMap<String, serde_json::Value>, streamed: bool) {
        let output = NotebookOutput::display(data, streamed);
        if streamed {
            if let NotebookOutput::DisplayData(display) = &output {
                if let Some(hook) = self.on_display.as_mut() {
                    hook(display);
                }
            }
        }
        self.outputs.push(output);
    }
}

/// A cheaply-cloneable handle the v8 bindings close over, so `console.log`
/// and the UI display hook can append to the same sink from inside
/// different callbacks without the borrow checker seeing two owners.
pub type SharedSink<'a> = Rc<std::cell::RefCell<OutputSink<'a>>>;
