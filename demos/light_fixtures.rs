//! Builds a room lit by a grid of identical ceiling fixtures on the software backend and
//! reports how the light sampling table turned out.
//!
//! ```sh
//! RUST_LOG=scoria=debug cargo run --example light_fixtures -- [config.ron]
//! ```

use std::process::ExitCode;

use scoria::prelude::*;
use tracing_subscriber::EnvFilter;

fn quad() -> ModelData {
    ModelData::new(
        [
            Vec3::new(-0.5, 0.0, -0.5),
            Vec3::new(0.5, 0.0, -0.5),
            Vec3::new(0.5, 0.0, 0.5),
            Vec3::new(-0.5, 0.0, 0.5),
        ],
        vec![[0, 2, 1], [0, 3, 2]],
    )
}

fn run() -> scoria::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => SceneConfig::load(path)?,
        None => SceneConfig::default(),
    };
    let groups = config.shader_groups;

    let mut backend = SoftwareBackend::new();
    let mut builder = SceneBuilder::new().with_config(config);
    let panel = builder.add_mesh(quad())?;

    builder.add_instance(InstanceDesc::new(panel, Mat4::from_scale(Vec3::splat(10.0))));
    for x in -2..=2 {
        for z in -2..=2 {
            let transform = Mat4::from_translation(Vec3::new(x as f32 * 2.0, 3.0, z as f32 * 2.0))
                * Mat4::from_rotation_x(std::f32::consts::PI);
            builder.add_instance(
                InstanceDesc::new(panel, transform)
                    .with_material(1)
                    .with_emission(Vec3::new(8.0, 7.5, 6.0))
                    .with_backface_culling(),
            );
        }
    }
    // One brighter, larger fixture breaks the symmetry.
    builder.add_instance(
        InstanceDesc::new(
            panel,
            Mat4::from_translation(Vec3::new(0.0, 3.0, 6.0)) * Mat4::from_scale(Vec3::splat(2.0)),
        )
        .with_material(2)
        .with_emission(Vec3::splat(20.0)),
    );

    let scene = builder.build(&mut backend)?;
    let pipeline = scoria::backend::software::SoftwarePipeline::new(groups.group_count());
    let sbt = ShaderBindingTable::new(&mut backend, &pipeline, groups)?;
    scene.check_binding_table(&sbt)?;

    let lights = scene.lights();
    tracing::info!(
        emitters = lights.len(),
        shared_cdfs = lights.duplicate_count(),
        triangle_cdf_entries = lights.triangle_cdf().len(),
        total_power = lights.total_weight(),
        "Light table"
    );
    for (i, data) in lights.instances().iter().enumerate() {
        tracing::debug!(
            emitter = i,
            range = ?data.cdf_range(),
            weight = data.weight,
            area = data.area,
            "Emitter"
        );
    }

    let mut hits = vec![0u32; lights.len()];
    let samples = 4096;
    for i in 0..samples {
        let u0 = (i as f32 + 0.5) / samples as f32;
        let u1 = (i as f32 * 0.618_034).fract();
        if let Some(sample) = lights.sample(u0, u1) {
            hits[sample.emitter] += 1;
        }
    }
    let bright = hits.len() - 1;
    tracing::info!(
        bright_fixture = hits[bright] as f32 / samples as f32,
        first_fixture = hits[0] as f32 / samples as f32,
        "Sample distribution"
    );

    let regions = sbt.regions();
    tracing::info!(
        stride = sbt.layout().stride(),
        hit_region = regions.hit.size,
        blas_bytes = scene.blases().total_size(),
        tlas_bytes = scene.tlas().size(),
        live_bytes = backend.live_bytes(),
        "Scene ready"
    );
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("Scene build failed: {err}");
            ExitCode::FAILURE
        }
    }
}
