//! Ads automation flow: landing analysis, angle resolution, then headlines,
//! copies and images for every angle.

use crate::pipeline::{
    image_prompt, DerivationError, PipelineDefinition, PipelineStage, StepInput, StepPlan,
    StepSpec,
};
use crate::ports::{
    AnglesRequest, CopiesRequest, HeadlinesRequest, LandingAnalysisRequest, PortRequest,
    PortResponse, PromptImageRequest, Provider, SourceImageRequest,
};
use crate::work_item::fragments::{
    AngleCopies, AngleHeadlines, AngleImages, AngleSource, AnglesResult,
};
use crate::work_item::Fragment;

pub const ANALYZE_LANDING: &str = "analyze_landing";
pub const RESOLVE_ANGLES: &str = "resolve_angles";
pub const GENERATE_HEADLINES: &str = "generate_headlines";
pub const GENERATE_COPIES: &str = "generate_copies";
pub const GENERATE_ANGLE_IMAGES: &str = "generate_angle_images";

const HEADLINES_PER_ANGLE: u8 = 5;
const COPIES_PER_ANGLE: u8 = 3;

pub fn definition() -> PipelineDefinition {
    PipelineDefinition {
        name: "ads_automation",
        stages: vec![
            PipelineStage::Single(StepSpec {
                name: ANALYZE_LANDING,
                provider: Provider::LandingAnalysis,
                fatal_on_error: false,
                derive: derive_analyze_landing,
                merge: merge_analyze_landing,
            }),
            PipelineStage::Single(StepSpec {
                name: RESOLVE_ANGLES,
                provider: Provider::Copy,
                fatal_on_error: true,
                derive: derive_resolve_angles,
                merge: merge_resolve_angles,
            }),
            PipelineStage::ForEachAngle(vec![
                StepSpec {
                    name: GENERATE_HEADLINES,
                    provider: Provider::Copy,
                    fatal_on_error: false,
                    derive: derive_headlines,
                    merge: merge_headlines,
                },
                StepSpec {
                    name: GENERATE_COPIES,
                    provider: Provider::Copy,
                    fatal_on_error: false,
                    derive: derive_copies,
                    merge: merge_copies,
                },
                StepSpec {
                    name: GENERATE_ANGLE_IMAGES,
                    provider: Provider::Images,
                    fatal_on_error: false,
                    derive: derive_angle_images,
                    merge: merge_angle_images,
                },
            ]),
        ],
    }
}

fn derive_analyze_landing(input: &StepInput<'_>) -> Result<StepPlan, DerivationError> {
    let Some(url) = input.snapshot.landing_url() else {
        return Ok(StepPlan::Skip {
            reason: String::from("no landing URL supplied"),
        });
    };
    Ok(StepPlan::Call(PortRequest::AnalyzeLanding(
        LandingAnalysisRequest {
            url: url.to_string(),
            brief: input.brief(),
            angle_count: input.snapshot.angle_count(),
        },
    )))
}

fn merge_analyze_landing(
    _input: &StepInput<'_>,
    response: PortResponse,
) -> Result<Vec<Fragment>, DerivationError> {
    match response {
        PortResponse::LandingAnalysis(analysis) => Ok(vec![Fragment::Analysis(analysis)]),
        other => Err(DerivationError::unexpected_response(ANALYZE_LANDING, &other)),
    }
}

fn derive_resolve_angles(input: &StepInput<'_>) -> Result<StepPlan, DerivationError> {
    let limit = input.snapshot.angle_count() as usize;
    if let Some(analysis) = input.fragments.analysis() {
        if !analysis.angles.is_empty() {
            let angles = analysis.angles.iter().take(limit).cloned().collect();
            return Ok(StepPlan::Resolved(vec![Fragment::Angles(AnglesResult {
                angles,
                source: AngleSource::Analysis,
            })]));
        }
    }
    Ok(StepPlan::Call(PortRequest::Angles(AnglesRequest {
        brief: input.brief(),
        count: input.snapshot.angle_count(),
        prompt_override: input.snapshot.prompt_overrides.angles.clone(),
    })))
}

fn merge_resolve_angles(
    input: &StepInput<'_>,
    response: PortResponse,
) -> Result<Vec<Fragment>, DerivationError> {
    match response {
        PortResponse::Angles(angles) if angles.is_empty() => {
            Err(DerivationError::new("no angles could be resolved"))
        }
        PortResponse::Angles(mut angles) => {
            angles.truncate(input.snapshot.angle_count() as usize);
            Ok(vec![Fragment::Angles(AnglesResult {
                angles,
                source: AngleSource::Generated,
            })])
        }
        other => Err(DerivationError::unexpected_response(RESOLVE_ANGLES, &other)),
    }
}

fn derive_headlines(input: &StepInput<'_>) -> Result<StepPlan, DerivationError> {
    let (_, angle) = input.require_angle()?;
    Ok(StepPlan::Call(PortRequest::Headlines(HeadlinesRequest {
        brief: input.brief(),
        angle: angle.clone(),
        count: HEADLINES_PER_ANGLE,
        prompt_override: input.snapshot.prompt_overrides.headlines.clone(),
    })))
}

fn merge_headlines(
    input: &StepInput<'_>,
    response: PortResponse,
) -> Result<Vec<Fragment>, DerivationError> {
    let (angle_index, _) = input.require_angle()?;
    match response {
        PortResponse::Headlines(headlines) if headlines.is_empty() => {
            Err(DerivationError::new("copy port returned no headlines"))
        }
        PortResponse::Headlines(headlines) => Ok(vec![Fragment::Headlines(AngleHeadlines {
            angle_index,
            headlines,
        })]),
        other => Err(DerivationError::unexpected_response(GENERATE_HEADLINES, &other)),
    }
}

fn derive_copies(input: &StepInput<'_>) -> Result<StepPlan, DerivationError> {
    let (angle_index, angle) = input.require_angle()?;
    // Copies are still generated when this angle's headlines failed.
    let headlines = input
        .fragments
        .headlines(angle_index)
        .map(|h| h.headlines.clone())
        .unwrap_or_default();
    Ok(StepPlan::Call(PortRequest::Copies(CopiesRequest {
        brief: input.brief(),
        angle: angle.clone(),
        headlines,
        count: COPIES_PER_ANGLE,
        prompt_override: input.snapshot.prompt_overrides.copies.clone(),
    })))
}

fn merge_copies(
    input: &StepInput<'_>,
    response: PortResponse,
) -> Result<Vec<Fragment>, DerivationError> {
    let (angle_index, _) = input.require_angle()?;
    match response {
        PortResponse::Copies(copies) if copies.is_empty() => {
            Err(DerivationError::new("copy port returned no copies"))
        }
        PortResponse::Copies(copies) => Ok(vec![Fragment::Copies(AngleCopies {
            angle_index,
            copies,
        })]),
        other => Err(DerivationError::unexpected_response(GENERATE_COPIES, &other)),
    }
}

fn derive_angle_images(input: &StepInput<'_>) -> Result<StepPlan, DerivationError> {
    let (angle_index, angle) = input.require_angle()?;
    let prompt = image_prompt(input.snapshot, Some(angle));
    let file_stem = format!("angle_{angle_index}");
    let count = input.snapshot.images_per_angle();
    let request = if input.snapshot.uploads.is_empty() {
        PortRequest::PromptImages(PromptImageRequest {
            work_item_id: input.work_item_id.to_string(),
            file_stem,
            prompt,
            count,
        })
    } else {
        PortRequest::SourceImages(SourceImageRequest {
            work_item_id: input.work_item_id.to_string(),
            file_stem,
            sources: input.snapshot.uploads.clone(),
            prompt,
            count,
        })
    };
    Ok(StepPlan::Call(request))
}

fn merge_angle_images(
    input: &StepInput<'_>,
    response: PortResponse,
) -> Result<Vec<Fragment>, DerivationError> {
    let (angle_index, _) = input.require_angle()?;
    match response {
        PortResponse::Images(images) if images.is_empty() => {
            Err(DerivationError::new("image port returned no images"))
        }
        PortResponse::Images(images) => Ok(vec![Fragment::AngleImages(AngleImages {
            angle_index,
            images,
        })]),
        other => Err(DerivationError::unexpected_response(GENERATE_ANGLE_IMAGES, &other)),
    }
}
