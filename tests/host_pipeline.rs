//! End-to-end frames on the host backend.

use photon_beam::accel::{BuildRangeSource, TlasBuildMode};
use photon_beam::beam::{BeamKind, CapacityBudget};
use photon_beam::frame::{FrameInputs, FrameRenderer};
use photon_beam::host::HostRenderer;
use photon_beam::scene::cornell_box;
use photon_beam::settings::{Backend, RenderSettings};
use photon_beam::util::Vec3;

fn small_settings(beams: u32, photons: u32) -> RenderSettings {
    let mut s = RenderSettings::default();
    s.backend = Backend::Host;
    s.width = 16;
    s.height = 16;
    s.collect_stats = true;
    s.volume.num_beam_samples = beams;
    s.volume.num_photon_samples = photons;
    s.capacity = CapacityBudget {
        max_beam_samples: beams.max(1),
        max_photon_samples: photons.max(1),
        beams_per_sample: 8,
        sub_beams_per_beam_sample: 200,
    };
    s
}

fn renderer(settings: &RenderSettings) -> HostRenderer {
    HostRenderer::new(settings, &cornell_box().unwrap()).unwrap()
}

#[test]
fn test_worst_case_budget_is_clamped() {
    let mut settings = small_settings(64, 64);
    // Far fewer slots than the paths want
    settings.capacity.beams_per_sample = 1;
    settings.capacity.sub_beams_per_beam_sample = 1;
    let mut r = renderer(&settings);

    let out = r.render_frame(&FrameInputs::new(&settings, 0, 0.0)).unwrap();
    let header = out.stats.unwrap().header;
    let arena = r.arena();

    assert!(header.beam_count <= arena.max_beams());
    assert!(header.sub_beam_count <= arena.max_sub_beams());
    assert!(header.overflowed(), "budget was meant to overflow: {header:?}");
    assert_eq!(arena.records().count() as u32, header.beam_count);

    // Every live instance points at a record that exists
    for slot in 0..header.sub_beam_count {
        let (_, index) = arena.instance(slot).decode();
        assert!(index < header.beam_count);
        assert!(arena.record(index).is_some());
    }
}

#[test]
fn test_zero_samples_leave_counters_zero() {
    let settings = small_settings(32, 32);
    let mut r = renderer(&settings);

    // Fill the arena first so the zero-fill has something to clear
    let first = r.render_frame(&FrameInputs::new(&settings, 0, 0.0)).unwrap();
    assert!(first.stats.unwrap().header.beam_count > 0);

    let mut inputs = FrameInputs::new(&settings, 1, 0.0);
    inputs.volume.use_photon_beam = false;
    inputs.volume.use_photon_mapping = false;
    let out = r.render_frame(&inputs).unwrap();
    let stats = out.stats.unwrap();
    assert_eq!(stats.header.beam_count, 0);
    assert_eq!(stats.header.sub_beam_count, 0);
    assert_eq!(stats.build.unwrap().leaf_instances, 0);
}

#[test]
fn test_build_leaves_match_device_count() {
    for range in [BuildRangeSource::DeviceIndirect, BuildRangeSource::CapacityPadded] {
        let mut settings = small_settings(48, 256);
        settings.build_range = range;
        let mut r = renderer(&settings);

        let out = r.render_frame(&FrameInputs::new(&settings, 0, 0.0)).unwrap();
        let stats = out.stats.unwrap();
        assert!(stats.header.sub_beam_count > 0);
        assert_eq!(stats.build.unwrap().leaf_instances, stats.header.sub_beam_count, "{range:?}");
    }
}

#[test]
fn test_update_mode_refits_repeated_frame() {
    let mut settings = small_settings(16, 16);
    settings.tlas_build_mode = TlasBuildMode::Update;
    settings.build_range = BuildRangeSource::CapacityPadded;
    let mut r = renderer(&settings);
    let inputs = FrameInputs::new(&settings, 0, 0.0);

    let first = r.render_frame(&inputs).unwrap().stats.unwrap();
    let second = r.render_frame(&inputs).unwrap().stats.unwrap();
    assert!(!first.build.unwrap().refit);
    assert!(second.build.unwrap().refit);
    assert_eq!(first.header, second.header);
}

#[test]
fn test_modes_off_means_no_in_scatter() {
    let settings = small_settings(64, 256);
    let mut r = renderer(&settings);

    let mut inputs = FrameInputs::new(&settings, 0, 0.0);
    inputs.volume.use_photon_beam = false;
    inputs.volume.use_photon_mapping = false;
    let off = r.render_frame(&inputs).unwrap().image;

    let params = r.pass_params(&inputs);
    let pass = r.render_pass(&inputs, &params);
    let cam = settings.camera.uniforms(settings.width, settings.height);
    for y in 0..settings.height {
        for x in 0..settings.width {
            let shading = pass.shade(&cam.primary_ray(x, y, settings.width, settings.height));
            assert_eq!(shading.in_scatter, Vec3::ZERO);
        }
    }

    // Direct color only shows the same surface term
    let mut direct = FrameInputs::new(&settings, 0, 0.0);
    direct.volume.show_direct_color = true;
    let only_direct = r.render_frame(&direct).unwrap().image;
    assert_eq!(off, only_direct);
}

#[test]
fn test_beams_add_light() {
    let settings = small_settings(256, 0);
    let mut r = renderer(&settings);

    let mut dark = FrameInputs::new(&settings, 0, 0.0);
    dark.volume.use_photon_beam = false;
    let without = r.render_frame(&dark).unwrap().image.mean();
    let with = r.render_frame(&FrameInputs::new(&settings, 0, 0.0)).unwrap().image.mean();

    assert!(with.is_finite());
    assert!(with.cmpge(without).all());
    assert!(with.max_element() > without.max_element());
}

#[test]
fn test_photons_are_tagged() {
    let settings = small_settings(0, 512);
    let mut r = renderer(&settings);
    let header = r
        .render_frame(&FrameInputs::new(&settings, 0, 0.0))
        .unwrap()
        .stats
        .unwrap()
        .header;

    let arena = r.arena();
    assert!(header.beam_count > 0);
    for slot in 0..header.sub_beam_count {
        let (kind, index) = arena.instance(slot).decode();
        assert_eq!(kind, BeamKind::Photon);
        assert_eq!(arena.record(index).and_then(|rec| rec.kind()), Some(BeamKind::Photon));
    }
}

#[test]
fn test_resize_changes_output() {
    let settings = small_settings(8, 8);
    let mut r = renderer(&settings);
    r.resize(8, 4).unwrap();
    let image = r.render_frame(&FrameInputs::new(&settings, 0, 0.0)).unwrap().image;
    assert_eq!((image.width, image.height), (8, 4));
    assert_eq!(image.pixels.len(), 32);
    assert!(r.resize(0, 4).is_err());
}
