//! Knowledge extraction pipeline: bounded fan-out over chapters, then merge.
//!
//! Each chapter gets one model call, gated by a semaphore so at most
//! `max_concurrent_chapters` calls are in flight at once. The stage is a
//! full barrier: every scheduled call is joined before merging. A failed
//! chapter is logged and dropped without disturbing its siblings; only zero
//! successes escalates. The merge is a single model call over all surviving
//! chapter results.

use crate::error::PipelineError;
use crate::llm::KnowledgeModel;
use crate::segmenter::ChapterUnit;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Reserved key carrying `{chapter_number, title}` provenance in each
/// per-chapter result.
pub const CHAPTER_INFO_KEY: &str = "_chapter_info";

/// Orchestrates per-chapter extraction and the final merge.
pub struct KnowledgeExtractor {
    model: Arc<dyn KnowledgeModel>,
    max_concurrent_chapters: usize,
}

impl KnowledgeExtractor {
    pub fn new(model: Arc<dyn KnowledgeModel>, max_concurrent_chapters: usize) -> Self {
        Self {
            model,
            max_concurrent_chapters,
        }
    }

    /// Run the full pipeline: fan out over `chapters`, then merge the
    /// surviving results into the template shape.
    pub async fn extract_knowledge(
        &self,
        chapters: Vec<ChapterUnit>,
        template: &Value,
    ) -> Result<Value, PipelineError> {
        let results = self.run_chapters(chapters, template).await?;

        info!(results = results.len(), "Starting knowledge merge");
        let merged = self
            .model
            .merge_knowledge(&results, template)
            .await
            .map_err(|source| {
                error!(error = %source, "Knowledge merge failed");
                PipelineError::Merge { source }
            })?;
        info!("Knowledge merge complete");

        Ok(merged)
    }

    /// Fan out one extraction call per chapter under the admission gate and
    /// join them all. Returns the successful results in completion order.
    async fn run_chapters(
        &self,
        chapters: Vec<ChapterUnit>,
        template: &Value,
    ) -> Result<Vec<Value>, PipelineError> {
        let total = chapters.len();
        info!(chapters = total, "Starting knowledge extraction");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_chapters));
        let template = Arc::new(template.clone());

        let mut tasks: JoinSet<Result<Value, u32>> = JoinSet::new();
        for chapter in chapters {
            let semaphore = Arc::clone(&semaphore);
            let template = Arc::clone(&template);
            let model = Arc::clone(&self.model);

            tasks.spawn(async move {
                // Scoped acquisition: the permit is released on every exit
                // path, success or failure.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");

                info!(
                    chapter = chapter.chapter_number,
                    title = %chapter.title,
                    "Processing chapter"
                );

                match model.extract_chapter(&chapter.content, &template).await {
                    Ok(mut result) => match tag_provenance(&mut result, &chapter) {
                        Ok(()) => {
                            info!(
                                chapter = chapter.chapter_number,
                                title = %chapter.title,
                                "Completed chapter"
                            );
                            Ok(result)
                        }
                        Err(detail) => {
                            error!(
                                chapter = chapter.chapter_number,
                                title = %chapter.title,
                                error = %detail,
                                "Failed to process chapter"
                            );
                            Err(chapter.chapter_number)
                        }
                    },
                    Err(err) => {
                        error!(
                            chapter = chapter.chapter_number,
                            title = %chapter.title,
                            error = %err,
                            "Failed to process chapter"
                        );
                        Err(chapter.chapter_number)
                    }
                }
            });
        }

        let mut results = Vec::new();
        let mut failures = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(_chapter)) => failures += 1,
                Err(join_err) => {
                    error!(error = %join_err, "Chapter task panicked");
                    failures += 1;
                }
            }
        }

        if results.is_empty() {
            error!(attempted = total, "No chapters processed successfully");
            return Err(PipelineError::Pipeline { attempted: total });
        }

        info!(
            succeeded = results.len(),
            failed = failures,
            "Chapter extraction complete"
        );
        Ok(results)
    }
}

/// Insert `{chapter_number, title}` provenance under the reserved key.
/// The model contract guarantees an object; anything else fails the chapter.
fn tag_provenance(result: &mut Value, chapter: &ChapterUnit) -> Result<(), String> {
    let obj = result
        .as_object_mut()
        .ok_or_else(|| "chapter result is not a JSON object".to_string())?;
    obj.insert(
        CHAPTER_INFO_KEY.to_string(),
        json!({
            "chapter_number": chapter.chapter_number,
            "title": chapter.title,
        }),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::segmenter::Segmenter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const FAIL_MARKER: &str = "FAIL_THIS_CHAPTER";

    /// Instrumented fake: records the concurrent-call high-water mark, fails
    /// chapters whose content carries the marker, and merges by
    /// concatenating `topics` arrays.
    struct FakeModel {
        current: AtomicUsize,
        high_water: AtomicUsize,
        merge_inputs: Mutex<Vec<String>>,
        fail_merge: bool,
    }

    impl FakeModel {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                merge_inputs: Mutex::new(Vec::new()),
                fail_merge: false,
            }
        }

        fn failing_merge() -> Self {
            Self {
                fail_merge: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl KnowledgeModel for FakeModel {
        async fn extract_chapter(
            &self,
            chapter_content: &str,
            _template: &Value,
        ) -> Result<Value, ModelError> {
            let in_flight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(in_flight, Ordering::SeqCst);

            // Hold the slot long enough for siblings to pile up
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if chapter_content.contains(FAIL_MARKER) {
                Err(ModelError::EmptyResponse)
            } else {
                Ok(json!({"topics": ["X"]}))
            }
        }

        async fn merge_knowledge(
            &self,
            chapter_results: &[Value],
            _template: &Value,
        ) -> Result<Value, ModelError> {
            self.merge_inputs.lock().unwrap().push(
                serde_json::to_string(chapter_results).unwrap(),
            );

            if self.fail_merge {
                return Err(ModelError::EmptyResponse);
            }

            let topics: Vec<Value> = chapter_results
                .iter()
                .flat_map(|r| {
                    r.get("topics")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default()
                })
                .collect();
            Ok(json!({ "topics": topics }))
        }
    }

    fn chapters(n: usize) -> Vec<ChapterUnit> {
        (1..=n)
            .map(|i| ChapterUnit {
                chapter_number: i as u32,
                title: format!("Chapter {i}"),
                content: format!("content of chapter {i}"),
            })
            .collect()
    }

    fn extractor(model: Arc<FakeModel>, limit: usize) -> KnowledgeExtractor {
        KnowledgeExtractor::new(model, limit)
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_the_ceiling() {
        let model = Arc::new(FakeModel::new());
        let result = extractor(Arc::clone(&model), 3)
            .run_chapters(chapters(10), &json!({"topics": []}))
            .await
            .unwrap();

        assert_eq!(result.len(), 10);
        assert!(model.high_water.load(Ordering::SeqCst) <= 3);
        // With 10 chapters and a generous hold time the gate should saturate
        assert_eq!(model.high_water.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_chapters_are_dropped_without_aborting_siblings() {
        let mut units = chapters(5);
        units[1].content.push_str(FAIL_MARKER);
        units[3].content.push_str(FAIL_MARKER);

        let model = Arc::new(FakeModel::new());
        let results = extractor(model, 2)
            .run_chapters(units, &json!({"topics": []}))
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        let mut surviving: Vec<u64> = results
            .iter()
            .map(|r| r[CHAPTER_INFO_KEY]["chapter_number"].as_u64().unwrap())
            .collect();
        surviving.sort_unstable();
        assert_eq!(surviving, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn all_chapters_failing_escalates_to_pipeline_failure() {
        let mut units = chapters(4);
        for unit in &mut units {
            unit.content.push_str(FAIL_MARKER);
        }

        let model = Arc::new(FakeModel::new());
        let err = extractor(model, 3)
            .run_chapters(units, &json!({"topics": []}))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Pipeline { attempted: 4 }));
    }

    #[tokio::test]
    async fn results_carry_chapter_provenance() {
        let model = Arc::new(FakeModel::new());
        let results = extractor(model, 3)
            .run_chapters(chapters(1), &json!({"topics": []}))
            .await
            .unwrap();

        let info = &results[0][CHAPTER_INFO_KEY];
        assert_eq!(info["chapter_number"], 1);
        assert_eq!(info["title"], "Chapter 1");
        assert_eq!(results[0]["topics"], json!(["X"]));
    }

    #[tokio::test]
    async fn merge_inputs_are_not_mutated_between_calls() {
        let model = Arc::new(FakeModel::new());
        let results = vec![
            json!({"topics": ["a"], CHAPTER_INFO_KEY: {"chapter_number": 1, "title": "T"}}),
            json!({"topics": ["b"], CHAPTER_INFO_KEY: {"chapter_number": 2, "title": "U"}}),
        ];
        let template = json!({"topics": []});

        model.merge_knowledge(&results, &template).await.unwrap();
        model.merge_knowledge(&results, &template).await.unwrap();

        let inputs = model.merge_inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0], inputs[1]);
    }

    #[tokio::test]
    async fn template_is_not_mutated_by_the_pipeline() {
        let model = Arc::new(FakeModel::new());
        let template = json!({"topics": [], "nested": {"keep": true}});
        let before = serde_json::to_string(&template).unwrap();

        extractor(model, 2)
            .extract_knowledge(chapters(3), &template)
            .await
            .unwrap();

        assert_eq!(serde_json::to_string(&template).unwrap(), before);
    }

    #[tokio::test]
    async fn merge_failure_surfaces_as_merge_error() {
        let model = Arc::new(FakeModel::failing_merge());
        let err = extractor(model, 2)
            .extract_knowledge(chapters(2), &json!({"topics": []}))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Merge { .. }));
    }

    #[tokio::test]
    async fn end_to_end_three_chapters_with_one_failure() {
        let text = format!(
            "Chapter 1 Basics\nGradient descent.\n\
             Chapter 2 Advanced\nBackpropagation.\n\
             Chapter 3 Broken\n{FAIL_MARKER}\n"
        );
        let units = Segmenter::new(4000, 200).segment(&text);
        assert_eq!(units.len(), 3);

        let model = Arc::new(FakeModel::new());
        let merged = extractor(Arc::clone(&model), 3)
            .extract_knowledge(units, &json!({"topics": []}))
            .await
            .unwrap();

        assert_eq!(merged, json!({"topics": ["X", "X"]}));
    }
}
