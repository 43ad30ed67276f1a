//! Filters that drop data frames; control and system frames always pass

use std::collections::HashSet;

use async_trait::async_trait;

use crate::frame::{Frame, FrameDirection, FrameFactory, FrameType};
use crate::processor::{FrameProcessor, ProcessorBase};

/// Keeps data frames for which the predicate returns true.
pub struct FrameFilter {
    base: ProcessorBase,
    predicate: Box<dyn Fn(&Frame) -> bool + Send + Sync>,
}

impl FrameFilter {
    pub fn new<F>(name: impl Into<String>, frames: &FrameFactory, predicate: F) -> Self
    where
        F: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        Self {
            base: ProcessorBase::new(name, frames),
            predicate: Box::new(predicate),
        }
    }
}

#[async_trait]
impl FrameProcessor for FrameFilter {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        if frame.is_pass_through() || (self.predicate)(&frame) {
            self.base.push_frame(frame, direction).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Only the listed types pass.
    Allow,
    /// Everything but the listed types passes.
    Deny,
}

pub struct TypeFilter {
    base: ProcessorBase,
    mode: FilterMode,
    types: HashSet<FrameType>,
}

impl TypeFilter {
    pub fn new(
        name: impl Into<String>,
        frames: &FrameFactory,
        mode: FilterMode,
        types: impl IntoIterator<Item = FrameType>,
    ) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
            mode,
            types: types.into_iter().collect(),
        }
    }

    pub fn allow(
        name: impl Into<String>,
        frames: &FrameFactory,
        types: impl IntoIterator<Item = FrameType>,
    ) -> Self {
        Self::new(name, frames, FilterMode::Allow, types)
    }

    pub fn deny(
        name: impl Into<String>,
        frames: &FrameFactory,
        types: impl IntoIterator<Item = FrameType>,
    ) -> Self {
        Self::new(name, frames, FilterMode::Deny, types)
    }

    fn passes(&self, frame: &Frame) -> bool {
        if frame.is_pass_through() {
            return true;
        }
        let listed = self.types.contains(&frame.frame_type());
        match self.mode {
            FilterMode::Allow => listed,
            FilterMode::Deny => !listed,
        }
    }
}

#[async_trait]
impl FrameProcessor for TypeFilter {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        if self.passes(&frame) {
            self.base.push_frame(frame, direction).await;
        }
    }
}

/// Drops every data frame.
pub struct NullFilter {
    base: ProcessorBase,
}

impl NullFilter {
    pub fn new(name: impl Into<String>, frames: &FrameFactory) -> Self {
        Self {
            base: ProcessorBase::new(name, frames),
        }
    }
}

#[async_trait]
impl FrameProcessor for NullFilter {
    fn base(&self) -> &ProcessorBase {
        &self.base
    }

    async fn process_frame(&self, frame: Frame, direction: FrameDirection) {
        self.base.process_frame(&frame).await;
        if frame.is_pass_through() {
            self.base.push_frame(frame, direction).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::processor::link_processors;
    use crate::test_utils::FrameRecorder;

    fn mixed(frames: &FrameFactory) -> Vec<Frame> {
        vec![
            frames.start(Default::default()),
            frames.text("hello"),
            frames.bytes(vec![1, 2]),
            frames.image_raw(vec![0; 4], (1, 1), None, None),
            frames.cancel(),
            frames.end(),
        ]
    }

    async fn run(filter: Arc<dyn FrameProcessor>, frames: &FrameFactory) -> Vec<FrameType> {
        let recorder = FrameRecorder::new(frames);
        link_processors(&[filter.clone(), recorder.clone()]);
        for frame in mixed(frames) {
            filter.process_frame(frame, FrameDirection::Downstream).await;
        }
        recorder.types()
    }

    #[tokio::test]
    async fn test_frame_filter_predicate() {
        let frames = FrameFactory::new();
        let filter = Arc::new(FrameFilter::new("short", &frames, |frame| {
            frame.frame_type() == FrameType::Bytes
        }));
        assert_eq!(
            run(filter, &frames).await,
            vec![FrameType::Start, FrameType::Bytes, FrameType::Cancel, FrameType::End]
        );
    }

    #[tokio::test]
    async fn test_type_filter_allow() {
        let frames = FrameFactory::new();
        let filter = Arc::new(TypeFilter::allow("text-only", &frames, [FrameType::Text]));
        assert_eq!(
            run(filter, &frames).await,
            vec![FrameType::Start, FrameType::Text, FrameType::Cancel, FrameType::End]
        );
    }

    #[tokio::test]
    async fn test_type_filter_deny() {
        let frames = FrameFactory::new();
        let filter = Arc::new(TypeFilter::deny(
            "no-media",
            &frames,
            [FrameType::ImageRaw, FrameType::Bytes, FrameType::End],
        ));
        // End is a control frame and cannot be filtered.
        assert_eq!(
            run(filter, &frames).await,
            vec![FrameType::Start, FrameType::Text, FrameType::Cancel, FrameType::End]
        );
    }

    #[tokio::test]
    async fn test_null_filter_keeps_only_control() {
        let frames = FrameFactory::new();
        let filter = Arc::new(NullFilter::new("null", &frames));
        assert_eq!(
            run(filter, &frames).await,
            vec![FrameType::Start, FrameType::Cancel, FrameType::End]
        );
    }
}
