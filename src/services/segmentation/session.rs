// ONNX Runtime session builder with automatic hardware acceleration detection

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, warn};

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

/// Calculate optimal thread count for ONNX Runtime CPU inference.
///
/// Every pool worker owns its own session, so each session gets a small
/// slice of the machine instead of all cores fighting inside one session.
fn optimal_intra_op_threads(pool_size: usize) -> usize {
    let total_cores = num_cpus::get();
    let per_session = total_cores / pool_size.max(1);
    let optimal = per_session.max(1);

    debug!(
        "CPU threads: {} total cores, {} per session across {} workers",
        total_cores, optimal, pool_size
    );
    optimal
}

/// Build an ONNX Runtime session for a matting model, trying acceleration
/// providers in order of preference before falling back to CPU.
///
/// # Returns
/// (backend_name, Session)
pub fn build_session(
    model_bytes: &[u8],
    model_name: &str,
    pool_size: usize,
) -> Result<(String, Session)> {
    let threads = optimal_intra_op_threads(pool_size);

    // Try TensorRT (if feature enabled)
    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([TensorRTExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            tracing::info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    // Try CUDA (if feature enabled)
    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            tracing::info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    // Try CoreML (Apple Silicon, if feature enabled)
    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CoreMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            tracing::info!("✓ Using CoreML acceleration for {}", model_name);
            return Ok(("CoreML".to_string(), session));
        }
    }

    // Try DirectML (Windows, if feature enabled)
    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        // DirectML requires sequential execution and disabled memory patterns
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_memory_pattern(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            tracing::info!("✓ Using DirectML acceleration for {}", model_name);
            return Ok(("DirectML".to_string(), session));
        }
    }

    // Final fallback: Pure CPU (no acceleration)
    let model_size_mb = model_bytes.len() as f32 / 1_048_576.0;
    let session = Session::builder()
        .context(format!("Failed to create ONNX session builder for {}", model_name))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context(format!("Failed to configure CPU execution provider for {}", model_name))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context(format!("Failed to set graph optimization level for {}", model_name))?
        .with_intra_threads(threads)
        .context(format!("Failed to configure intra-op threads for {}", model_name))?
        .with_inter_threads(1)
        .context(format!("Failed to configure inter-op threads for {}", model_name))?
        .commit_from_memory(model_bytes)
        .context(format!(
            "Failed to load {} ONNX model from memory ({:.1} MB). \
            This usually indicates:\n  \
            1. Model file corruption during transfer\n  \
            2. ONNX Runtime version/platform mismatch\n  \
            3. Model created with incompatible ONNX opset version",
            model_name, model_size_mb
        ))?;

    warn!(
        "⚠️  Using CPU-only inference for {} (no GPU acceleration available)",
        model_name
    );
    Ok(("CPU".to_string(), session))
}
