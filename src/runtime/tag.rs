//! Stream tags: positional metadata attached to item offsets
//!
//! A tag rides with the buffer its producer wrote to, anchored to an absolute
//! item offset (a monotonic counter, never ring-relative). Downstream blocks
//! see the tags whose offsets fall inside the current invocation window; the
//! scheduler translates offsets across a block according to its declared
//! propagation policy.

use super::flowgraph::BlockId;
use super::message::Message;

/// Immutable metadata record anchored to a stream offset
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Absolute item offset on the stream the tag is attached to.
    pub offset: u64,
    pub key: String,
    pub value: Message,
    /// Block that produced the tag.
    pub src: BlockId,
}

impl Tag {
    pub fn new(offset: u64, key: impl Into<String>, value: Message, src: BlockId) -> Self {
        Self {
            offset,
            key: key.into(),
            value,
            src,
        }
    }
}

/// Cumulative counts at the time of the current invocation, used to re-anchor
/// tag offsets across a block
#[derive(Debug, Clone, Copy)]
pub struct RescaleWindow {
    /// Input items consumed before this invocation.
    pub consumed_base: u64,
    /// Output items produced before this invocation.
    pub produced_base: u64,
    /// Ratio of output items to input items.
    pub relative_rate: f64,
}

impl RescaleWindow {
    /// Re-anchor an input offset to the output stream:
    /// `floor((o - consumed_base) * relative_rate) + produced_base`.
    pub fn rescale(&self, offset: u64) -> u64 {
        let local = offset.saturating_sub(self.consumed_base) as f64;
        (local * self.relative_rate).floor() as u64 + self.produced_base
    }
}

/// Explicit tag mapping supplied by a block using `TagPropagation::Custom`.
///
/// Given the input port a tag arrived on, the tag itself, and the rescale
/// window of the current invocation, returns the tags to emit as
/// `(output_port, tag)` pairs.
pub type TagMapFn = fn(usize, &Tag, &RescaleWindow) -> Vec<(usize, Tag)>;

/// How tags cross a block
#[derive(Debug, Clone, Copy, Default)]
pub enum TagPropagation {
    /// Every input tag appears on every output port, offset rescaled.
    #[default]
    AllToAll,
    /// Tags on input port i appear only on output port i, offset rescaled.
    OneToOne,
    /// The block fully owns its tags; nothing is propagated automatically.
    None,
    /// The block supplies an explicit mapping function.
    Custom(TagMapFn),
}

/// Collect, per input view, the consumed base and the tags whose offsets
/// fall inside the consumed span of the current invocation. Tags beyond the
/// consumed span stay with the buffer and reappear in the next window.
pub(crate) fn consumed_tag_windows(
    inputs: &[super::buffer::StreamInput],
) -> Vec<(u64, Vec<Tag>)> {
    inputs
        .iter()
        .map(|view| {
            let end = view.offset() + view.consumed() as u64;
            let window = view
                .tags()
                .iter()
                .filter(|t| t.offset < end)
                .cloned()
                .collect();
            (view.offset(), window)
        })
        .collect()
}

/// Apply a propagation policy to the tags consumed on each input port.
///
/// `per_input[i]` holds the tags consumed on input port i together with that
/// port's consumed base; `out_bases[o]` is output port o's produced base.
/// Returns the tags to attach per output port, already re-anchored.
pub(crate) fn propagate_tags(
    policy: TagPropagation,
    relative_rate: f64,
    per_input: &[(u64, Vec<Tag>)],
    out_bases: &[u64],
    src: BlockId,
) -> Vec<Vec<Tag>> {
    let mut out: Vec<Vec<Tag>> = out_bases.iter().map(|_| Vec::new()).collect();
    match policy {
        TagPropagation::None => {}
        TagPropagation::AllToAll => {
            for (consumed_base, tags) in per_input {
                for tag in tags {
                    for (o, produced_base) in out_bases.iter().enumerate() {
                        let window = RescaleWindow {
                            consumed_base: *consumed_base,
                            produced_base: *produced_base,
                            relative_rate,
                        };
                        out[o].push(Tag {
                            offset: window.rescale(tag.offset),
                            key: tag.key.clone(),
                            value: tag.value.clone(),
                            src,
                        });
                    }
                }
            }
        }
        TagPropagation::OneToOne => {
            for (i, (consumed_base, tags)) in per_input.iter().enumerate() {
                let Some(produced_base) = out_bases.get(i) else {
                    continue;
                };
                let window = RescaleWindow {
                    consumed_base: *consumed_base,
                    produced_base: *produced_base,
                    relative_rate,
                };
                for tag in tags {
                    out[i].push(Tag {
                        offset: window.rescale(tag.offset),
                        key: tag.key.clone(),
                        value: tag.value.clone(),
                        src,
                    });
                }
            }
        }
        TagPropagation::Custom(map) => {
            for (i, (consumed_base, tags)) in per_input.iter().enumerate() {
                for tag in tags {
                    // The mapping function gets one window per input port; its
                    // produced_base is filled per returned output port below.
                    for (o, mapped) in tags_from_custom(map, i, tag, *consumed_base, relative_rate, out_bases) {
                        out[o].push(mapped);
                    }
                }
            }
        }
    }
    out
}

fn tags_from_custom(
    map: TagMapFn,
    input_port: usize,
    tag: &Tag,
    consumed_base: u64,
    relative_rate: f64,
    out_bases: &[u64],
) -> Vec<(usize, Tag)> {
    let window = RescaleWindow {
        consumed_base,
        produced_base: 0,
        relative_rate,
    };
    map(input_port, tag, &window)
        .into_iter()
        .filter(|(o, _)| *o < out_bases.len())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(offset: u64) -> Tag {
        Tag::new(offset, "test", Message::Null, BlockId(0))
    }

    #[test]
    fn test_rescale_identity_rate() {
        let w = RescaleWindow {
            consumed_base: 100,
            produced_base: 100,
            relative_rate: 1.0,
        };
        assert_eq!(w.rescale(150), 150);
    }

    #[test]
    fn test_rescale_decimation() {
        // 1-in-4 decimator: a tag at input offset o lands at floor(o / 4).
        let w = RescaleWindow {
            consumed_base: 0,
            produced_base: 0,
            relative_rate: 0.25,
        };
        assert_eq!(w.rescale(0), 0);
        assert_eq!(w.rescale(3), 0);
        assert_eq!(w.rescale(4), 1);
        assert_eq!(w.rescale(1023), 255);
    }

    #[test]
    fn test_rescale_interpolation_with_bases() {
        // 1:2 interpolator mid-stream: consumed 10, produced 20 so far.
        let w = RescaleWindow {
            consumed_base: 10,
            produced_base: 20,
            relative_rate: 2.0,
        };
        assert_eq!(w.rescale(10), 20);
        assert_eq!(w.rescale(13), 26);
    }

    #[test]
    fn test_all_to_all_fans_out() {
        let routed = propagate_tags(
            TagPropagation::AllToAll,
            1.0,
            &[(0, vec![tag(5)])],
            &[0, 0],
            BlockId(7),
        );
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0].len(), 1);
        assert_eq!(routed[1].len(), 1);
        assert_eq!(routed[0][0].offset, 5);
        assert_eq!(routed[0][0].src, BlockId(7));
    }

    #[test]
    fn test_one_to_one_keeps_lanes() {
        let routed = propagate_tags(
            TagPropagation::OneToOne,
            1.0,
            &[(0, vec![tag(1)]), (0, vec![tag(2)])],
            &[0, 0],
            BlockId(0),
        );
        assert_eq!(routed[0].len(), 1);
        assert_eq!(routed[0][0].offset, 1);
        assert_eq!(routed[1].len(), 1);
        assert_eq!(routed[1][0].offset, 2);
    }

    #[test]
    fn test_none_drops_everything() {
        let routed = propagate_tags(
            TagPropagation::None,
            1.0,
            &[(0, vec![tag(1), tag(2)])],
            &[0],
            BlockId(0),
        );
        assert!(routed[0].is_empty());
    }
}
