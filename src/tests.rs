// Whole compositor tests
//
// The native compositor runs on a mock target and renderer, the system
// compositor runs either on top of that or on a recording mock.
use crate::compositor::*;
use crate::config::Config;
use crate::head::SimulatedHmd;
use crate::mock::*;
use crate::multi::{ClientCompositor, SessionInfo, SessionState, SystemCompositor, MAX_CLIENTS};
use crate::native::{NativeCompositor, NATIVE_MAX_LAYERS};

use strata::{
    vk, BlendMode, EyeVisibility, Fov, HeadDevice, LayerData, LayerKind, LayerType, Pose,
    ProjectionView, QuadData, Rect, RenderMode, StrataError, SubImage,
};
use utils::timing::{get_current_ns, NS_PER_MS};

use std::sync::{Arc, Mutex};
use std::time::Duration;

const PERIOD: i64 = 16 * NS_PER_MS;

struct Harness {
    native: Arc<NativeCompositor>,
    target: Arc<Mutex<MockTargetState>>,
    renderer: Arc<Mutex<MockRendererState>>,
    hmd: Arc<dyn HeadDevice>,
}

fn harness(sampler_budget: u32) -> Harness {
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let target = MockTarget::new(PERIOD);
    let renderer = MockRenderer::new(hmd.clone(), sampler_budget);
    let target_state = target.state();
    let renderer_state = renderer.state();

    let native = NativeCompositor::new(
        Box::new(target),
        Box::new(renderer),
        Arc::new(MockResources::new()),
        hmd.clone(),
        &Config::default(),
    );

    Harness {
        native: Arc::new(native),
        target: target_state,
        renderer: renderer_state,
        hmd: hmd,
    }
}

fn system_config(warm_start: bool) -> Config {
    Config {
        do_warm_start: warm_start,
        ..Default::default()
    }
}

fn color_info() -> SwapchainCreateInfo {
    SwapchainCreateInfo::new(1024, 1024, vk::Format::R8G8B8A8_SRGB.as_raw() as i64)
}

fn projection_data() -> LayerData {
    let view = ProjectionView {
        sub: SubImage {
            image_index: 0,
            array_index: 0,
            rect: Rect::new(0, 0, 1024, 1024),
        },
        fov: Fov::new(-0.7, 0.7, 0.7, -0.7),
        pose: Pose::identity(),
    };
    LayerData::new(LayerKind::StereoProjection { l: view, r: view })
}

fn quad_data() -> LayerData {
    LayerData::new(LayerKind::Quad(QuadData {
        visibility: EyeVisibility::Both,
        size: [1.0, 1.0],
        ..Default::default()
    }))
}

/// Poll `cond` for up to two seconds
fn wait_for<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = get_current_ns() + 2_000 * NS_PER_MS;
    while get_current_ns() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// A sync file that is already signaled
fn signaled_fence() -> GraphicsSyncHandle {
    let (rd, wr) = nix::unistd::pipe().unwrap();
    nix::unistd::write(&wr, b"x").unwrap();
    GraphicsSyncHandle::from_fd(rd)
}

/// Run one frame with `count` projection layers on the native compositor
fn native_frame(h: &Harness, sc: &Arc<dyn Swapchain>, count: usize) -> XrResult<FrameTiming> {
    let t = h.native.wait_frame()?;
    h.native.begin_frame(t.frame_id)?;
    h.native
        .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)?;
    for _ in 0..count {
        h.native
            .layer_stereo_projection(&h.hmd, sc, sc, &projection_data())?;
    }
    h.native
        .layer_commit(t.frame_id, GraphicsSyncHandle::invalid())?;
    Ok(t)
}

/// Run one client frame, the layers are added by `add`
fn client_frame<F>(client: &dyn Compositor, add: F) -> XrResult<FrameTiming>
where
    F: FnOnce(&dyn Compositor) -> XrResult<()>,
{
    let t = client.wait_frame()?;
    client.begin_frame(t.frame_id)?;
    client.layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)?;
    add(client)?;
    client.layer_commit(t.frame_id, GraphicsSyncHandle::invalid())?;
    Ok(t)
}

#[test]
fn single_projection_layer_takes_fast_path() {
    let h = harness(16);
    let system = SystemCompositor::new(h.native.clone(), &system_config(false)).unwrap();

    let client = system.create_client(SessionInfo::default()).unwrap();
    client.begin_session(ViewType::Stereo).unwrap();
    client.set_state(true, true).unwrap();

    let sc = client.create_swapchain(&color_info()).unwrap();
    assert_eq!(sc.image_count(), 3);

    // the client's pacer has to be on the display grid first
    assert!(wait_for(|| system.frames_rendered() > 0));

    let t = client.wait_frame().unwrap();
    client.begin_frame(t.frame_id).unwrap();
    client
        .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
        .unwrap();
    let idx = sc.acquire_image().unwrap();
    sc.wait_image(100 * NS_PER_MS, idx).unwrap();
    sc.release_image(idx).unwrap();
    client
        .layer_stereo_projection(&h.hmd, &sc, &sc, &projection_data())
        .unwrap();
    client.layer_commit(t.frame_id, signaled_fence()).unwrap();

    let next = client.wait_frame().unwrap();
    assert_eq!(next.frame_id, t.frame_id + 1);
    let step = next.predicted_display_time - t.predicted_display_time;
    assert!(
        (step - next.predicted_display_period).abs() <= NS_PER_MS / 2,
        "display time moved by {} with a period of {}",
        step,
        next.predicted_display_period
    );

    let renderer = h.renderer.clone();
    assert!(wait_for(|| renderer.lock().unwrap().draws.iter().any(|d| {
        d.layer_types == vec![LayerType::StereoProjection]
            && d.mode == RenderMode::FastProjection { timewarp: false }
    })));
    assert!(wait_for(|| client.slot_summary().delivered == Some((t.predicted_display_time, 1))));

    drop(client);
    drop(system);
    assert_eq!(h.target.lock().unwrap().violations, 0);
}

#[test]
fn out_of_date_acquire_recreates_target() {
    let h = harness(16);
    h.target
        .lock()
        .unwrap()
        .acquire_errors
        .push_back(StrataError::OUT_OF_DATE);
    h.native.begin_session(ViewType::Stereo).unwrap();

    let sc = h.native.create_swapchain(&color_info()).unwrap();
    native_frame(&h, &sc, 1).unwrap();

    let target = h.target.lock().unwrap();
    assert_eq!(target.create_images_calls, 2);
    assert_eq!(target.presents.len(), 1);
    assert_eq!(target.violations, 0);

    let renderer = h.renderer.lock().unwrap();
    assert_eq!(renderer.renderings_created, 2);
    assert_eq!(renderer.renderings_closed, 1);
    assert_eq!(renderer.draws.len(), 1);
}

#[test]
fn out_of_date_present_recreates_before_next_frame() {
    let h = harness(16);
    h.target
        .lock()
        .unwrap()
        .present_errors
        .push_back(StrataError::OUT_OF_DATE);

    let sc = h.native.create_swapchain(&color_info()).unwrap();
    native_frame(&h, &sc, 1).unwrap();
    native_frame(&h, &sc, 1).unwrap();

    let target = h.target.lock().unwrap();
    assert_eq!(target.create_images_calls, 2);
    assert_eq!(target.presents.len(), 2);
    assert_eq!(target.violations, 0);
}

#[test]
fn stale_scheduled_frame_is_replaced() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();
    let sc = client.create_swapchain(&color_info()).unwrap();

    // far enough out that the stale frame is not in the past yet
    let display = get_current_ns() + 1_000 * NS_PER_MS;
    let stale = display - 50 * NS_PER_MS;

    let submit = |display_time: i64| {
        let t = client.wait_frame().unwrap();
        client.begin_frame(t.frame_id).unwrap();
        client
            .layer_begin(t.frame_id, display_time, BlendMode::Opaque)
            .unwrap();
        client.layer_quad(&hmd, &sc, &quad_data()).unwrap();
        client
            .layer_commit(t.frame_id, GraphicsSyncHandle::invalid())
            .unwrap();
    };

    submit(stale);
    assert_eq!(client.slot_summary().scheduled, Some((stale, 1)));

    client.shared().slots.lock().unwrap().next_frame_display = display;
    submit(display);
    assert_eq!(client.slot_summary().scheduled, Some((display, 1)));

    // not due yet
    client.shared().deliver_any_frames(display - NS_PER_MS);
    assert_eq!(client.slot_summary().delivered, None);

    client.shared().deliver_any_frames(display);
    let slots = client.slot_summary();
    assert_eq!(slots.delivered, Some((display, 1)));
    assert_eq!(slots.scheduled, None);
}

#[test]
fn scheduled_frame_past_its_display_time_is_replaced() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    // no session is running, nothing gets delivered
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();
    let sc = client.create_swapchain(&color_info()).unwrap();

    let first = get_current_ns() + 300 * NS_PER_MS;
    let second = first + 100 * NS_PER_MS;

    let submit = |display_time: i64| {
        let t = client.wait_frame().unwrap();
        client.begin_frame(t.frame_id).unwrap();
        client
            .layer_begin(t.frame_id, display_time, BlendMode::Opaque)
            .unwrap();
        client.layer_quad(&hmd, &sc, &quad_data()).unwrap();
        client.layer_commit(t.frame_id, signaled_fence()).unwrap();
    };

    submit(first);
    submit(second);
    // the wait thread holds on to the second frame
    assert_eq!(client.slot_summary().scheduled, Some((first, 1)));

    // layer_begin can't reuse progress before the wait thread let go
    let t = client.wait_frame().unwrap();
    client.begin_frame(t.frame_id).unwrap();
    client
        .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
        .unwrap();
    assert!(get_current_ns() >= first);

    let slots = client.slot_summary();
    assert_eq!(slots.scheduled, Some((second, 1)));
    assert_eq!(slots.delivered, None);
}

#[test]
fn newer_frame_for_the_next_display_replaces_a_waiting_one() {
    let h = harness(16);
    let system = SystemCompositor::new(h.native.clone(), &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();
    client.begin_session(ViewType::Stereo).unwrap();
    client.set_state(true, true).unwrap();
    let sc = client.create_swapchain(&color_info()).unwrap();
    assert!(wait_for(|| system.frames_rendered() > 0));

    // not due for a long time
    let t = client.wait_frame().unwrap();
    client.begin_frame(t.frame_id).unwrap();
    let far = t.predicted_display_time + 1_000 * t.predicted_display_period;
    client.layer_begin(t.frame_id, far, BlendMode::Opaque).unwrap();
    client.layer_quad(&h.hmd, &sc, &quad_data()).unwrap();
    client.layer_commit(t.frame_id, signaled_fence()).unwrap();

    let next = client.wait_frame().unwrap();
    client.begin_frame(next.frame_id).unwrap();
    client
        .layer_begin(next.frame_id, next.predicted_display_time, BlendMode::Opaque)
        .unwrap();
    client.layer_quad(&h.hmd, &sc, &quad_data()).unwrap();
    client.layer_commit(next.frame_id, signaled_fence()).unwrap();

    // the render thread announcing that display time frees the slot
    assert!(wait_for(|| client.slot_summary().delivered
        == Some((next.predicted_display_time, 1))));
    assert_eq!(client.slot_summary().scheduled, None);
    assert!(wait_for(|| h
        .renderer
        .lock()
        .unwrap()
        .draws
        .iter()
        .any(|d| d.layer_types == vec![LayerType::Quad])));
}

#[test]
fn overlay_is_drawn_after_primary() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();

    // created first so list order alone would draw it first
    let overlay = system
        .create_client(SessionInfo {
            is_overlay: true,
            z_order: 10,
        })
        .unwrap();
    let primary = system.create_client(SessionInfo::default()).unwrap();

    for c in [&overlay, &primary] {
        c.begin_session(ViewType::Stereo).unwrap();
        c.set_state(true, true).unwrap();
    }

    let proj_sc = primary.create_swapchain(&color_info()).unwrap();
    let quad_sc = overlay.create_swapchain(&color_info()).unwrap();

    client_frame(&overlay, |c| c.layer_quad(&hmd, &quad_sc, &quad_data())).unwrap();
    client_frame(&primary, |c| {
        c.layer_stereo_projection(&hmd, &proj_sc, &proj_sc, &projection_data())
    })
    .unwrap();

    assert!(wait_for(|| mock
        .committed()
        .iter()
        .any(|f| f.layer_types().len() == 2)));

    let frame = mock
        .committed()
        .into_iter()
        .find(|f| f.layer_types().len() == 2)
        .unwrap();
    assert_eq!(
        frame.layer_types(),
        vec![LayerType::StereoProjection, LayerType::Quad]
    );
}

/// Deliver one layer from each client and return the first frame with both
fn composite_pair(
    mock: &MockCompositor,
    hmd: &Arc<dyn HeadDevice>,
    first: (&ClientCompositor, LayerData),
    second: (&ClientCompositor, LayerData),
) -> Vec<LayerType> {
    for (c, data) in [first, second] {
        c.begin_session(ViewType::Stereo).unwrap();
        c.set_state(true, true).unwrap();
        let sc = c.create_swapchain(&color_info()).unwrap();
        client_frame(c, |c| match data.layer_type() {
            LayerType::Quad => c.layer_quad(hmd, &sc, &data),
            _ => c.layer_stereo_projection(hmd, &sc, &sc, &data),
        })
        .unwrap();
    }

    assert!(wait_for(|| mock
        .committed()
        .iter()
        .any(|f| f.layer_types().len() == 2)));
    mock.committed()
        .into_iter()
        .find(|f| f.layer_types().len() == 2)
        .unwrap()
        .layer_types()
}

#[test]
fn overlay_follows_primary_of_equal_z() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();

    let overlay = system
        .create_client(SessionInfo {
            is_overlay: true,
            z_order: 0,
        })
        .unwrap();
    let primary = system.create_client(SessionInfo::default()).unwrap();

    let types = composite_pair(
        &mock,
        &hmd,
        (&overlay, quad_data()),
        (&primary, projection_data()),
    );
    assert_eq!(types, vec![LayerType::StereoProjection, LayerType::Quad]);
}

#[test]
fn overlays_of_equal_z_keep_creation_order() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();

    let info = SessionInfo {
        is_overlay: true,
        z_order: 4,
    };
    let older = system.create_client(info).unwrap();
    let newer = system.create_client(info).unwrap();

    // the projection would sort first if layer type mattered
    let types = composite_pair(
        &mock,
        &hmd,
        (&older, quad_data()),
        (&newer, projection_data()),
    );
    assert_eq!(types, vec![LayerType::Quad, LayerType::StereoProjection]);
}

#[test]
fn invisible_clients_are_not_composited() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();

    let hidden = system.create_client(SessionInfo::default()).unwrap();
    hidden.begin_session(ViewType::Stereo).unwrap();
    let sc = hidden.create_swapchain(&color_info()).unwrap();
    client_frame(&hidden, |c| c.layer_quad(&hmd, &sc, &quad_data())).unwrap();

    assert!(wait_for(|| hidden.slot_summary().delivered.is_some()));
    // frames committed after delivery had the chance to include it
    let committed = mock.committed().len();
    assert!(wait_for(|| mock.committed().len() > committed + 1));
    assert!(mock.committed().iter().all(|f| f.layers.is_empty()));
}

#[test]
fn layers_over_sampler_budget_are_dropped() {
    let h = harness(16);
    let sc = h.native.create_swapchain(&color_info()).unwrap();

    native_frame(&h, &sc, 32).unwrap();

    let renderer = h.renderer.lock().unwrap();
    let draw = &renderer.draws[0];
    assert_eq!(draw.mode, RenderMode::Layered);
    assert_eq!(draw.layer_types.len(), 32);
    assert!(draw.layer_types[..16]
        .iter()
        .all(|t| *t == LayerType::StereoProjection));
    assert!(draw.layer_types[16..].iter().all(|t| *t == LayerType::Max));
    assert_eq!(h.native.stats()[0].layers_drawn, 16);
    assert_eq!(h.target.lock().unwrap().presents.len(), 1);
}

#[test]
fn native_layer_overflow_still_presents() {
    let h = harness(16);
    let system = SystemCompositor::new(h.native.clone(), &system_config(false)).unwrap();

    // more delivered layers than one native frame holds
    let clients: Vec<_> = (0..9)
        .map(|_| system.create_client(SessionInfo::default()).unwrap())
        .collect();
    assert!(clients.len() * strata::MAX_LAYERS > NATIVE_MAX_LAYERS);

    for client in clients.iter() {
        client.begin_session(ViewType::Stereo).unwrap();
        client.set_state(true, true).unwrap();
        let sc = client.create_swapchain(&color_info()).unwrap();
        client_frame(client, |c| {
            for _ in 0..strata::MAX_LAYERS {
                c.layer_quad(&h.hmd, &sc, &quad_data())?;
            }
            Ok(())
        })
        .unwrap();
    }

    assert!(wait_for(|| clients
        .iter()
        .all(|c| c.slot_summary().delivered.is_some())));
    let renderer = h.renderer.clone();
    assert!(wait_for(|| renderer
        .lock()
        .unwrap()
        .draws
        .iter()
        .any(|d| d.layer_types.len() == NATIVE_MAX_LAYERS)));

    // frames keep going while the overflow lasts
    let presents = h.target.lock().unwrap().presents.len();
    assert!(wait_for(|| h.target.lock().unwrap().presents.len() > presents + 1));
}

#[test]
fn warm_start_presents_one_frame_then_stops() {
    let h = harness(16);
    let system = SystemCompositor::new(h.native.clone(), &system_config(true)).unwrap();

    assert!(wait_for(|| system.state() == SessionState::Stopped
        && system.frames_rendered() == 1));
    std::thread::sleep(Duration::from_millis(100));

    assert_eq!(system.frames_rendered(), 1);
    assert_eq!(h.target.lock().unwrap().presents.len(), 1);
    assert!(!h.native.session_active());
}

#[test]
fn system_session_follows_active_clients() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();
    assert_eq!(system.state(), SessionState::Stopped);

    let client = system.create_client(SessionInfo::default()).unwrap();
    client.begin_session(ViewType::Stereo).unwrap();
    assert_eq!(system.active_count(), 1);
    assert!(wait_for(|| system.state() == SessionState::Running));

    // begin twice is a caller error
    assert_eq!(client.begin_session(ViewType::Stereo), Err(XrError::INVALID));

    client.end_session().unwrap();
    assert_eq!(system.active_count(), 0);
    assert!(wait_for(|| system.state() == SessionState::Stopped));

    let calls = mock.calls();
    assert!(calls.contains(&MockCall::BeginSession(ViewType::Stereo)));
    assert!(calls.contains(&MockCall::EndSession));
}

#[test]
fn dropping_a_client_ends_its_session() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();

    let client = system.create_client(SessionInfo::default()).unwrap();
    client.begin_session(ViewType::Stereo).unwrap();
    assert_eq!(system.client_count(), 1);

    drop(client);
    assert_eq!(system.client_count(), 0);
    assert_eq!(system.active_count(), 0);
    assert!(wait_for(|| system.state() == SessionState::Stopped));
}

#[test]
fn client_slots_never_exceed_max_layers() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();
    let sc = client.create_swapchain(&color_info()).unwrap();

    let t = client.wait_frame().unwrap();
    client.begin_frame(t.frame_id).unwrap();
    client
        .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
        .unwrap();
    for _ in 0..strata::MAX_LAYERS {
        client.layer_quad(&hmd, &sc, &quad_data()).unwrap();
    }
    assert_eq!(
        client.layer_quad(&hmd, &sc, &quad_data()),
        Err(XrError::INVALID)
    );
    assert_eq!(
        client.slot_summary().progress,
        Some((t.predicted_display_time, strata::MAX_LAYERS))
    );
}

#[test]
fn layers_outside_the_bracket_are_rejected() {
    let h = harness(16);
    let sc = h.native.create_swapchain(&color_info()).unwrap();
    assert_eq!(
        h.native.layer_stereo_projection(&h.hmd, &sc, &sc, &projection_data()),
        Err(XrError::INVALID)
    );
    assert_eq!(
        h.native.layer_commit(1, GraphicsSyncHandle::invalid()),
        Err(XrError::INVALID)
    );

    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();
    assert_eq!(
        client.layer_stereo_projection(&h.hmd, &sc, &sc, &projection_data()),
        Err(XrError::INVALID)
    );
    assert_eq!(
        client.layer_commit(1, GraphicsSyncHandle::invalid()),
        Err(XrError::INVALID)
    );
}

#[test]
fn wrong_swapchain_count_is_rejected() {
    let h = harness(16);
    let sc = h.native.create_swapchain(&color_info()).unwrap();
    let t = h.native.predict_frame().unwrap();
    h.native
        .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
        .unwrap();

    // quad data handed to the projection entry point
    assert_eq!(
        h.native.layer_stereo_projection(&h.hmd, &sc, &sc, &quad_data()),
        Err(XrError::INVALID)
    );
}

#[test]
fn every_acquire_is_presented_once() {
    let h = harness(16);
    let sc = h.native.create_swapchain(&color_info()).unwrap();

    for _ in 0..5 {
        native_frame(&h, &sc, 1).unwrap();
    }

    let target = h.target.lock().unwrap();
    assert_eq!(target.presents.len(), 5);
    assert_eq!(target.violations, 0);
    // the next image is acquired early
    assert_eq!(target.outstanding.len(), 1);
    assert_eq!(h.native.acquired_buffer(), target.outstanding[0] as i32);
}

#[test]
fn display_times_never_go_backwards() {
    let h = harness(16);
    let sc = h.native.create_swapchain(&color_info()).unwrap();

    for _ in 0..4 {
        native_frame(&h, &sc, 1).unwrap();
    }

    let stats = h.native.stats();
    assert_eq!(stats.len(), 4);
    for pair in stats.windows(2) {
        assert!(pair[1].predicted_display_time >= pair[0].predicted_display_time);
        assert_eq!(pair[1].frame_id, pair[0].frame_id + 1);
    }
}

#[test]
fn target_not_ready_skips_drawing() {
    let h = harness(16);
    h.target.lock().unwrap().ready = false;
    let sc = h.native.create_swapchain(&color_info()).unwrap();

    native_frame(&h, &sc, 1).unwrap();
    assert!(h.renderer.lock().unwrap().draws.is_empty());
    assert!(h.target.lock().unwrap().presents.is_empty());

    h.target.lock().unwrap().ready = true;
    native_frame(&h, &sc, 1).unwrap();
    assert_eq!(h.target.lock().unwrap().presents.len(), 1);
}

#[test]
fn predicted_frame_is_the_one_waited_for() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();

    let p = client.predict_frame().unwrap();
    assert_eq!(p.predicted_gpu_time, 0);
    let t = client.wait_frame().unwrap();
    assert_eq!(t.frame_id, p.frame_id);
    assert_eq!(t.predicted_display_time, p.predicted_display_time);

    // without a prediction wait_frame makes its own
    let next = client.wait_frame().unwrap();
    assert_eq!(next.frame_id, p.frame_id + 1);
}

#[test]
fn discard_before_begin_is_invalid() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();

    let p = client.predict_frame().unwrap();
    assert_eq!(client.discard_frame(p.frame_id), Err(XrError::INVALID));

    let t = client.wait_frame().unwrap();
    client.begin_frame(t.frame_id).unwrap();
    client.discard_frame(t.frame_id).unwrap();
}

#[test]
fn semaphore_commit_waits_for_value() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let hmd: Arc<dyn HeadDevice> = Arc::new(SimulatedHmd::new(PERIOD));
    let system = SystemCompositor::new(mock.clone(), &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();
    let sc = client.create_swapchain(&color_info()).unwrap();

    let (_fd, sem) = client.create_semaphore().unwrap();
    let mock_sem = mock.resources().semaphores()[0].clone();

    let t = client.wait_frame().unwrap();
    client.begin_frame(t.frame_id).unwrap();
    client
        .layer_begin(t.frame_id, t.predicted_display_time, BlendMode::Opaque)
        .unwrap();
    client.layer_quad(&hmd, &sc, &quad_data()).unwrap();
    client
        .layer_commit_with_semaphore(t.frame_id, sem, 3)
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(client.slot_summary().scheduled, None);
    assert!(client.slot_summary().progress.is_some());

    let signaler = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        mock_sem.signal(3);
    });

    // blocks until the wait thread moved the frame on
    let next = client.wait_frame().unwrap();
    client.begin_frame(next.frame_id).unwrap();
    client
        .layer_begin(next.frame_id, next.predicted_display_time, BlendMode::Opaque)
        .unwrap();
    assert_eq!(
        client.slot_summary().scheduled,
        Some((t.predicted_display_time, 1))
    );
    signaler.join().unwrap();
}

#[test]
fn control_events_reach_the_client() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();
    let client = system.create_client(SessionInfo::default()).unwrap();

    client.set_state(true, true).unwrap();
    // no change, no event
    client.set_state(true, true).unwrap();
    client.set_main_app_visibility(false).unwrap();
    client.set_z_order(-3).unwrap();

    assert_eq!(
        client.poll_events().unwrap(),
        Event::StateChange {
            visible: true,
            focused: true
        }
    );
    assert_eq!(
        client.poll_events().unwrap(),
        Event::OverlayChange { visible: false }
    );
    assert_eq!(client.poll_events().unwrap(), Event::None);
    assert_eq!(client.z_order(), -3);
    assert!(client.is_visible());
}

#[test]
fn client_table_is_bounded() {
    let mock = Arc::new(MockCompositor::new(PERIOD));
    let system = SystemCompositor::new(mock, &system_config(false)).unwrap();

    let clients: Vec<_> = (0..MAX_CLIENTS)
        .map(|_| system.create_client(SessionInfo::default()).unwrap())
        .collect();
    assert_eq!(
        system.create_client(SessionInfo::default()).err(),
        Some(XrError::OUT_OF_RESOURCES)
    );

    drop(clients);
    assert_eq!(system.client_count(), 0);
    assert!(system.create_client(SessionInfo::default()).is_ok());
}

#[test]
fn native_session_events() {
    let h = harness(16);
    h.native.begin_session(ViewType::Stereo).unwrap();
    assert_eq!(
        h.native.begin_session(ViewType::Stereo),
        Err(XrError::INVALID)
    );
    h.native.end_session().unwrap();

    assert_eq!(
        h.native.poll_events().unwrap(),
        Event::StateChange {
            visible: true,
            focused: true
        }
    );
    assert_eq!(
        h.native.poll_events().unwrap(),
        Event::StateChange {
            visible: false,
            focused: false
        }
    );
    assert_eq!(h.native.poll_events().unwrap(), Event::None);
}
