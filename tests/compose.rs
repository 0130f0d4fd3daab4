//! End-to-end composition scenarios against the headless device.

use {
    prism::{
        backend::HeadlessDevice, BufferSpec, Engine, EngineConfig, Event, Extent2d, ManualClock,
        OutputCaps, OutputKey, PixelRect, Region, ShmFormat, SurfaceKey, ViewState,
    },
    std::sync::Arc,
};

fn engine_with_output(
    extent: Extent2d,
    buffers: usize,
    caps: OutputCaps,
) -> (Engine<HeadlessDevice>, OutputKey) {
    let mut device = HeadlessDevice::new();
    let sink = device.create_sink(extent, buffers, caps);
    let mut engine = Engine::new(device, ManualClock::new(), EngineConfig::default()).unwrap();
    let output = engine.create_output(sink);
    (engine, output)
}

fn full_damage(extent: Extent2d) -> Region {
    Region::from_rect(PixelRect::from_extent(extent))
}

fn attach_solid(
    engine: &mut Engine<HeadlessDevice>,
    color: [f32; 4],
    extent: Extent2d,
) -> SurfaceKey {
    let surface = engine.create_surface();
    engine.handle_event(Event::BufferAttached {
        surface,
        spec: BufferSpec::Solid { color, extent },
    });
    surface
}

/// 256 translucent bars blended over an orange background: red must
/// fall and blue must rise monotonically along the row.
#[test]
fn alpha_ramp_blends_monotonically() {
    let extent = Extent2d {
        width: 768,
        height: 16,
    };
    let (mut engine, output) = engine_with_output(extent, 1, OutputCaps::empty());

    let background = attach_solid(&mut engine, [1.0, 0.5, 0.0, 1.0], extent);
    engine.set_view(output, background, ViewState::at(0.0, 0.0), 0);

    // Bar n is 3 pixels of premul(0, 1-a, 1, a) with a = n/255.
    let mut data = Vec::with_capacity(768 * 16 * 4);
    for _row in 0..16 {
        for x in 0..768u32 {
            let n = x / 3;
            let a = n as f32 / 255.0;
            let g = ((1.0 - a) * a * 255.0).round() as u8;
            // BGRA in memory.
            data.extend_from_slice(&[(a * 255.0).round() as u8, g, 0, n as u8]);
        }
    }

    let bars = engine.create_surface();
    engine.handle_event(Event::BufferAttached {
        surface: bars,
        spec: BufferSpec::Shm {
            format: ShmFormat::Argb8888,
            extent,
            stride_pixels: 768,
            data: Arc::from(data.into_boxed_slice()),
        },
    });
    engine.set_view(output, bars, ViewState::at(0.0, 0.0), 1);

    engine.handle_event(Event::FrameRequested {
        output,
        damage: full_damage(extent),
    });

    let pixels = engine.capture_output(output).unwrap();
    let texel = |x: usize| -> (u8, u8) { (pixels[x * 4], pixels[x * 4 + 2]) };

    let (mut prev_red, mut prev_blue) = texel(0);
    for x in 1..768 {
        let (red, blue) = texel(x);
        assert!(red <= prev_red, "red rose at x = {x}: {prev_red} -> {red}");
        assert!(
            blue >= prev_blue,
            "blue fell at x = {x}: {prev_blue} -> {blue}"
        );
        prev_red = red;
        prev_blue = blue;
    }

    // The ends of the ramp are pure background and pure foreground.
    assert_eq!(texel(0), (255, 0));
    let (red_end, blue_end) = texel(767);
    assert!(red_end <= 1 && blue_end >= 254);
}

/// With the stock sRGB profile attached to the output the whole GPU
/// pipeline (pre-curve LUT, 3D LUT, shadow FBO, blend→output blit)
/// must reproduce grays within a couple of 8-bit codes.
#[test]
fn managed_srgb_output_is_near_identity() {
    let extent = Extent2d {
        width: 8,
        height: 8,
    };
    let (mut engine, output) = engine_with_output(extent, 1, OutputCaps::empty());

    let profile = engine.color().stock_srgb();
    engine.handle_event(Event::OutputProfileAttached {
        output,
        profile: Some(profile),
    });

    for code in [0u8, 64, 128, 192, 255] {
        let v = code as f32 / 255.0;
        let surface = attach_solid(&mut engine, [v, v, v, 1.0], extent);
        engine.set_view(output, surface, ViewState::at(0.0, 0.0), 0);

        engine.handle_event(Event::FrameRequested {
            output,
            damage: full_damage(extent),
        });

        let pixels = engine.capture_output(output).unwrap();
        for c in 0..3 {
            let got = pixels[c] as i32;
            assert!(
                (got - code as i32).abs() <= 3,
                "code {code} channel {c} came back as {got}"
            );
        }

        engine.handle_event(Event::SurfaceDestroyed { surface });
    }
}

/// The shadow FBO only exists while the output needs a blend space.
#[test]
fn shadow_fbo_follows_the_output_profile() {
    let extent = Extent2d {
        width: 8,
        height: 8,
    };
    let (mut engine, output) = engine_with_output(extent, 1, OutputCaps::empty());

    let surface = attach_solid(&mut engine, [0.5, 0.5, 0.5, 1.0], extent);
    engine.set_view(output, surface, ViewState::at(0.0, 0.0), 0);

    engine.handle_event(Event::FrameRequested {
        output,
        damage: full_damage(extent),
    });
    let direct_draws = engine.device().draw_log().len();
    assert!(direct_draws > 0);

    let profile = engine.color().stock_srgb();
    engine.handle_event(Event::OutputProfileAttached {
        output,
        profile: Some(profile),
    });
    engine.device_mut().clear_draw_log();

    engine.handle_event(Event::FrameRequested {
        output,
        damage: full_damage(extent),
    });

    use prism::backend::RenderTarget;
    let log = engine.device().draw_log();
    assert!(
        log.iter()
            .any(|d| matches!(d.target, RenderTarget::Framebuffer(_))),
        "no draw went through the shadow FBO"
    );
    assert!(
        log.iter().any(|d| matches!(d.target, RenderTarget::Sink(_))),
        "the shadow was never blitted to the sink"
    );

    // Detaching the profile goes back to direct drawing.
    engine.handle_event(Event::OutputProfileAttached {
        output,
        profile: None,
    });
    engine.device_mut().clear_draw_log();
    engine.handle_event(Event::FrameRequested {
        output,
        damage: full_damage(extent),
    });
    assert!(engine
        .device()
        .draw_log()
        .iter()
        .all(|d| matches!(d.target, RenderTarget::Sink(_))));
}

/// A rotated view draws through the general clipping path and stays
/// inside its bounding box.
#[test]
fn rotated_view_composites_within_bounds() {
    let extent = Extent2d {
        width: 64,
        height: 64,
    };
    let (mut engine, output) = engine_with_output(extent, 1, OutputCaps::empty());

    let background = attach_solid(&mut engine, [0.0, 0.0, 0.0, 1.0], extent);
    engine.set_view(output, background, ViewState::at(0.0, 0.0), 0);

    let square = attach_solid(
        &mut engine,
        [1.0, 1.0, 1.0, 1.0],
        Extent2d {
            width: 16,
            height: 16,
        },
    );
    // Rotate 30° around the surface origin, then move to mid-output.
    let rotation = glam::Mat3::from_translation(glam::Vec2::new(32.0, 32.0))
        * glam::Mat3::from_angle(30f32.to_radians());
    engine.set_view(
        output,
        square,
        ViewState {
            transform: rotation,
            alpha: 1.0,
            clip: Region::new(),
        },
        1,
    );

    engine.handle_event(Event::FrameRequested {
        output,
        damage: full_damage(extent),
    });

    let pixels = engine.capture_output(output).unwrap();
    let white_at = |x: usize, y: usize| pixels[(y * 64 + x) * 4] > 200;

    // A point clearly inside the rotated square.
    assert!(white_at(36, 40));
    // Far corners stay background.
    assert!(!white_at(2, 2));
    assert!(!white_at(60, 60));
    // Nothing may leak outside the transformed bounding box.
    for x in 0..64 {
        assert!(!white_at(x, 2));
        assert!(!white_at(x, 62));
    }
}
