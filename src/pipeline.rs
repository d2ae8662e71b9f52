//! Slide processing pipeline
//!
//! Wires the planner, worker pool, stitcher and assembler into the per-slide
//! flow, and drives dataset runs with manifest-based resume. Model and
//! classifier collaborators are resolved once at construction; accelerator
//! state is explicitly released between slides.

use crate::assemble::ResultAssembler;
use crate::config::{DatasetEntry, InferenceConfig, SlideSource};
use crate::dispatch::{run_tiles, CancelFlag, PoolConfig};
use crate::error::{PipelineError, Result};
use crate::grid::TileGridPlanner;
use crate::manifest::ProcessedManifest;
use crate::model::{CellClassifier, SegmentationModel};
use crate::reader::{resolve_metadata, SlideReader};
use crate::resources::SystemProfile;
use crate::stitch::{GlobalStitcher, StitchSettings};
use crate::types::{SlideProperties, SlideResult, SlideStage};
use crate::worker::PatchWorker;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Hand-off seam for the out-of-scope writers (JSON, GeoJSON, graph).
pub trait ResultExporter {
    fn export(&self, result: &SlideResult) -> Result<()>;
}

/// Outcome of a dataset run
#[derive(Debug, Default)]
pub struct DatasetSummary {
    /// Slides processed (and exported) in this run
    pub processed: Vec<String>,
    /// Slides that failed; the run continued past them
    pub failed: Vec<String>,
    /// Slides skipped because the manifest already listed them
    pub skipped: usize,
}

/// Whole-slide cell detection pipeline.
pub struct CellDetectionPipeline {
    config: InferenceConfig,
    profile: SystemProfile,
    model: Mutex<Box<dyn SegmentationModel>>,
    classifier: Option<Mutex<Box<dyn CellClassifier>>>,
    worker: PatchWorker,
    planner: TileGridPlanner,
    stitcher: GlobalStitcher,
    cancel: CancelFlag,
}

impl std::fmt::Debug for CellDetectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellDetectionPipeline")
            .field("config", &self.config)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl CellDetectionPipeline {
    /// Build a pipeline from validated configuration and resolved
    /// collaborators.
    ///
    /// Configuration errors surface here, before any slide is touched.
    pub fn new(
        config: InferenceConfig,
        profile: SystemProfile,
        model: Box<dyn SegmentationModel>,
        classifier: Option<Box<dyn CellClassifier>>,
    ) -> Result<Self> {
        config.validate()?;

        if model.input_size() != config.patch_size {
            return Err(PipelineError::config(format!(
                "patch_size: configured {} but model '{}' expects {}",
                config.patch_size,
                model.name(),
                model.input_size()
            )));
        }
        if let Some(classifier) = &classifier {
            if classifier.num_classes() != config.taxonomy.num_classes() {
                return Err(PipelineError::config(format!(
                    "taxonomy: '{}' defines {} classes but the classifier head has {}",
                    config.taxonomy,
                    config.taxonomy.num_classes(),
                    classifier.num_classes()
                )));
            }
        }

        let planner = TileGridPlanner::new(config.patch_size, config.overlap)?;
        let worker = PatchWorker::new(&config);
        let stitcher = GlobalStitcher::new(StitchSettings::from(&config));

        log::info!(
            "pipeline ready: model {} ({}), taxonomy {}, {} workers",
            config.model,
            model.name(),
            config.taxonomy,
            profile.worker_count
        );

        Ok(Self {
            config,
            profile,
            model: Mutex::new(model),
            classifier: classifier.map(Mutex::new),
            worker,
            planner,
            stitcher,
            cancel: CancelFlag::new(),
        })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn profile(&self) -> &SystemProfile {
        &self.profile
    }

    /// Clone of the cancellation handle; setting it aborts the current
    /// slide and stops a dataset run at the next slide boundary.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.profile.worker_count,
            max_in_flight: self.config.max_in_flight,
            batch_size: self.config.batch_size,
            tile_timeout: Duration::from_secs(self.config.tile_timeout_secs),
        }
    }

    fn transition(&self, name: &str, stage: &mut SlideStage, next: SlideStage) {
        log::debug!("slide '{}': {} -> {}", name, stage, next);
        *stage = next;
    }

    /// Process a single slide into a [`SlideResult`].
    ///
    /// Per-tile failures degrade and are recorded in the result's log;
    /// slide-level failures (unreadable pixels, invariant violations,
    /// cancellation) fail the slide as a whole.
    pub fn process_wsi(
        &self,
        name: &str,
        reader: &mut dyn SlideReader,
        properties: &SlideProperties,
    ) -> Result<SlideResult> {
        let mut stage = SlideStage::Planned;
        match self.run_slide(name, reader, properties, &mut stage) {
            Ok(result) => Ok(result),
            Err(e) => {
                log::error!("slide '{}': failed at stage {}: {}", name, stage, e);
                Err(e)
            }
        }
    }

    fn run_slide(
        &self,
        name: &str,
        reader: &mut dyn SlideReader,
        properties: &SlideProperties,
        stage: &mut SlideStage,
    ) -> Result<SlideResult> {
        let metadata = resolve_metadata(name, reader, properties)?;
        reader.set_resolution(metadata.target_mpp)?;

        let (width, height) = metadata.target_dimensions();
        let tiles = self.planner.plan(width, height);
        log::info!(
            "slide '{}': {} tiles over {}x{} px at {:.4} mpp",
            name,
            tiles.len(),
            width,
            height,
            metadata.target_mpp
        );

        self.transition(name, stage, SlideStage::Dispatching);
        let per_tile = {
            let mut model = self
                .model
                .lock()
                .map_err(|_| PipelineError::pool("model mutex poisoned"))?;
            run_tiles(
                reader,
                &tiles,
                &self.worker,
                &mut model,
                self.classifier.as_ref(),
                &self.pool_config(),
                &self.cancel,
            )?
        };
        let (per_tile, processing_log) = per_tile;

        self.transition(name, stage, SlideStage::Stitching);
        let cells = self.stitcher.stitch(per_tile);

        let result = ResultAssembler::assemble(metadata, cells, processing_log)?;
        self.transition(name, stage, SlideStage::Assembled);
        Ok(result)
    }

    /// Process every slide of the configured source.
    ///
    /// `open` constructs a reader per slide path (the WSI codec collaborator
    /// lives behind it). Slides listed in the output directory's manifest
    /// are skipped; each successfully exported slide is appended to it, so
    /// interrupted runs resume. Per-slide failures are logged and the run
    /// continues with the next slide.
    pub fn process_dataset<F>(
        &self,
        mut open: F,
        exporter: Option<&dyn ResultExporter>,
    ) -> Result<DatasetSummary>
    where
        F: FnMut(&Path) -> Result<Box<dyn SlideReader>>,
    {
        let entries = self.resolve_entries()?;
        let mut manifest = ProcessedManifest::load(&self.config.outdir)?;
        if !manifest.is_empty() {
            log::info!("Found processed files: {}", manifest.len());
        }

        let mut summary = DatasetSummary::default();
        let total = entries.len();

        for (index, entry) in entries.iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "dataset run cancelled after {} slides",
                    summary.processed.len()
                );
                break;
            }
            log::info!("Progress: {}/{}", index + 1, total);

            let file_name = entry
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.path.display().to_string());
            if manifest.contains(&file_name) {
                log::info!("slide '{}': already processed, skipping", file_name);
                summary.skipped += 1;
                continue;
            }
            let name = entry
                .path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_name.clone());

            let outcome = open(&entry.path)
                .and_then(|mut reader| self.process_wsi(&name, reader.as_mut(), &entry.properties));

            match outcome {
                Ok(result) => {
                    let mut stage = SlideStage::Assembled;
                    let export_ok = match exporter {
                        Some(exporter) => match exporter.export(&result) {
                            Ok(()) => {
                                self.transition(&name, &mut stage, SlideStage::Exported);
                                true
                            }
                            Err(e) => {
                                log::error!("slide '{}': export failed: {}", name, e);
                                false
                            }
                        },
                        None => true,
                    };
                    if export_ok {
                        manifest.mark_processed(&file_name)?;
                        summary.processed.push(file_name);
                    } else {
                        summary.failed.push(file_name);
                    }
                }
                Err(PipelineError::Cancelled) => {
                    log::warn!("dataset run aborted during slide '{}'", name);
                    break;
                }
                Err(e) => {
                    log::error!("slide '{}': {}", name, e);
                    summary.failed.push(file_name);
                }
            }

            self.release_model_state();
        }

        log::info!(
            "dataset finished: {} processed, {} failed, {} skipped",
            summary.processed.len(),
            summary.failed.len(),
            summary.skipped
        );
        Ok(summary)
    }

    /// Resolve the ordered list of slides to process
    fn resolve_entries(&self) -> Result<Vec<DatasetEntry>> {
        match &self.config.source {
            SlideSource::Single { path, properties } => Ok(vec![DatasetEntry {
                path: path.clone(),
                properties: *properties,
            }]),
            SlideSource::Dataset {
                folder: Some(folder),
                filelist: None,
                extension,
            } => {
                let mut paths = Vec::new();
                for entry in std::fs::read_dir(folder)? {
                    let path = entry?.path();
                    let matches = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .map_or(false, |e| e.eq_ignore_ascii_case(extension));
                    if matches {
                        paths.push(path);
                    }
                }
                paths.sort();
                log::info!("Found {} files inside folder", paths.len());
                Ok(paths
                    .into_iter()
                    .map(|path| DatasetEntry {
                        path,
                        properties: SlideProperties::default(),
                    })
                    .collect())
            }
            SlideSource::Dataset {
                folder: None,
                filelist: Some(filelist),
                ..
            } => Ok(filelist.clone()),
            // validate() rejects the remaining combinations eagerly
            _ => Err(PipelineError::config(
                "source: provide either a slide folder or a file list, not both",
            )),
        }
    }

    /// Drop accelerator state between slides so device memory does not
    /// accumulate across a dataset run.
    fn release_model_state(&self) {
        if let Ok(mut model) = self.model.lock() {
            model.release();
        }
    }
}
