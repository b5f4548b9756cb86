//! Streaming removal of `<think>` / `<thinking>` spans from assistant text.

const OPEN_TAGS: &[&str] = &["<think>", "<thinking>"];
const CLOSE_TAGS: &[&str] = &["</think>", "</thinking>"];

/// A piece of filtered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Visible(String),
    Thought(String),
}

/// Splits streamed text into visible and reasoning segments.
///
/// Tags may straddle chunk boundaries, so a trailing partial tag is held
/// back until the next chunk (or [`ThinkFilter::flush`]) disambiguates it.
#[derive(Debug, Clone, Default)]
pub struct ThinkFilter {
    in_think: bool,
    held: String,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_think(&self) -> bool {
        self.in_think
    }

    pub fn push(&mut self, text: &str) -> Vec<Segment> {
        let mut buffer = std::mem::take(&mut self.held);
        buffer.push_str(text);
        let mut segments = Vec::new();

        loop {
            let tags = if self.in_think { CLOSE_TAGS } else { OPEN_TAGS };
            if let Some((index, tag_len)) = find_earliest(&buffer, tags) {
                self.emit(&mut segments, &buffer[..index]);
                buffer.drain(..index + tag_len);
                self.in_think = !self.in_think;
                continue;
            }

            let keep = partial_tag_suffix(&buffer, tags);
            let split = buffer.len() - keep;
            self.emit(&mut segments, &buffer[..split]);
            self.held = buffer[split..].to_string();
            break;
        }

        segments
    }

    /// End of stream. Held-back visible text is released; an unterminated
    /// think span stays hidden.
    pub fn flush(&mut self) -> Vec<Segment> {
        let held = std::mem::take(&mut self.held);
        let segments = if self.in_think || held.is_empty() {
            Vec::new()
        } else {
            vec![Segment::Visible(held)]
        };
        self.in_think = false;
        segments
    }

    pub fn reset(&mut self) {
        self.in_think = false;
        self.held.clear();
    }

    fn emit(&self, segments: &mut Vec<Segment>, text: &str) {
        if text.is_empty() {
            return;
        }
        let segment = if self.in_think {
            Segment::Thought(text.to_string())
        } else {
            Segment::Visible(text.to_string())
        };
        segments.push(segment);
    }
}

/// Strip think spans from a complete text. Returns the visible text and the
/// extracted reasoning spans in order.
pub fn strip_think_tags(text: &str) -> (String, Vec<String>) {
    let mut filter = ThinkFilter::new();
    let mut segments = filter.push(text);
    segments.extend(filter.flush());

    let mut visible = String::new();
    let mut thoughts: Vec<String> = Vec::new();
    let mut last_was_thought = false;
    for segment in segments {
        match segment {
            Segment::Visible(text) => {
                visible.push_str(&text);
                last_was_thought = false;
            }
            Segment::Thought(text) => {
                match thoughts.last_mut() {
                    Some(last) if last_was_thought => last.push_str(&text),
                    _ => thoughts.push(text),
                }
                last_was_thought = true;
            }
        }
    }
    (visible, thoughts)
}

fn find_earliest(haystack: &str, tags: &[&str]) -> Option<(usize, usize)> {
    tags.iter()
        .filter_map(|tag| haystack.find(tag).map(|index| (index, tag.len())))
        .min_by_key(|(index, _)| *index)
}

/// Length of the longest suffix of `text` that is a proper prefix of a tag.
fn partial_tag_suffix(text: &str, tags: &[&str]) -> usize {
    tags.iter()
        .flat_map(|tag| (1..tag.len()).map(move |len| &tag[..len]))
        .filter(|prefix| text.ends_with(prefix))
        .map(str::len)
        .max()
        .unwrap_or(0)
}
