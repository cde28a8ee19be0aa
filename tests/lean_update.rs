//! Per-frame lean refits of animated instances.

use std::sync::Arc;

use rtaccel::accel::{Blas, Tlas};
use rtaccel::device::{
    AccelStructInstance, AccessFlags, BuildMode, Command, CommandBuffer, Context, HeadlessDevice,
};
use rtaccel::scene::{GeometryStore, Mesh, MeshInstance, Primitive, TransformNode, Vertex};
use rtaccel::util::{Mat4, TransformMatrix, Vec3};
use rtaccel::AccelConfig;

struct Fixture {
    device: Arc<HeadlessDevice>,
    ctx: Context,
    _store: GeometryStore,
    blas: Blas,
}

fn fixture() -> Fixture {
    let device = Arc::new(HeadlessDevice::new());
    let ctx: Context = device.clone();
    let vertices: Vec<Vertex> = (0..4).map(|i| Vertex::new([i as f32, 0.0, 1.0])).collect();
    let store = GeometryStore::create(&ctx, &vertices, &[0, 1, 2, 2, 1, 3]).expect("geometry upload failed");
    let mut blas = Blas::new();
    blas.create_or_update(
        &ctx,
        Arc::new(Mesh::new("quad", vec![Primitive::new(0, 0, 6, 3)])),
        &store,
        None,
    )
    .expect("BLAS build failed");
    Fixture { device, ctx, _store: store, blas }
}

fn translation(x: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
}

fn read_instances(f: &Fixture, tlas: &Tlas) -> Vec<AccelStructInstance> {
    f.device
        .read_pod(
            tlas.instance_buffer().device_buffer().handle().expect("no instance buffer"),
            0,
            tlas.instance_count(),
        )
        .expect("instance readback failed")
}

#[test]
fn test_no_animated_instances_records_nothing() {
    let f = fixture();
    let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
    tlas.add_instance_static(&f.blas.instance_ref(), translation(1.0));
    tlas.create_or_update().expect("TLAS build failed");

    let before = read_instances(&f, &tlas);
    let stats = f.device.stats();
    let mut cmd = CommandBuffer::new("frame");
    tlas.update_lean(&mut cmd, 0).expect("lean update failed");

    assert!(cmd.is_empty());
    assert_eq!(cmd.barrier_count(), 0);
    assert_eq!(f.device.stats(), stats);
    assert_eq!(read_instances(&f, &tlas), before);
}

#[test]
fn test_no_animated_instances_skips_dirty_check() {
    let f = fixture();
    let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
    let mut cmd = CommandBuffer::new("frame");
    tlas.update_lean(&mut cmd, 0).expect("lean update failed");
    assert!(cmd.is_empty());
}

#[test]
#[should_panic(expected = "dirty")]
fn test_lean_update_while_dirty_panics() {
    let f = fixture();
    let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
    tlas.add_instance_animated(&f.blas.instance_ref(), Box::new(Mat4::default));
    let mut cmd = CommandBuffer::new("frame");
    let _ = tlas.update_lean(&mut cmd, 0);
}

#[test]
fn test_lean_update_touches_only_animated_tail() {
    let f = fixture();
    let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
    let r = f.blas.instance_ref();
    let node = TransformNode::new("mover", translation(5.0), false);

    tlas.add_instance_static(&r, translation(1.0));
    tlas.add_instance_auto(&MeshInstance::new(node.clone(), r.clone()));
    tlas.add_instance_static(&r, translation(2.0));
    tlas.create_or_update().expect("TLAS build failed");
    let before = read_instances(&f, &tlas);

    node.set_global(translation(42.0));
    let mut cmd = CommandBuffer::new("frame 3");
    tlas.update_lean(&mut cmd, 3).expect("lean update failed");

    // copy barrier, copy, build barrier, refit
    assert_eq!(cmd.len(), 4);
    match &cmd.commands()[1] {
        Command::CopyBuffer { regions, .. } => {
            assert_eq!(regions.len(), 1);
            assert_eq!(regions[0].dst_offset, 2 * AccelStructInstance::SIZE);
            assert_eq!(regions[0].size, AccelStructInstance::SIZE);
        }
        other => panic!("expected copy, got {other:?}"),
    }
    match &cmd.commands()[2] {
        Command::PipelineBarrier { memory, .. } => {
            assert_eq!(memory[0].src_access, AccessFlags::TRANSFER_WRITE);
            assert_eq!(memory[0].dst_access, AccessFlags::ACCEL_STRUCT_WRITE);
        }
        other => panic!("expected barrier, got {other:?}"),
    }
    match &cmd.commands()[3] {
        Command::BuildAccelerationStructure { info, ranges } => {
            assert_eq!(info.mode, BuildMode::Update);
            assert_eq!(info.src, tlas.handle());
            assert_eq!(info.dst, tlas.handle());
            assert_eq!(ranges[0].primitive_count, 3);
        }
        other => panic!("expected build, got {other:?}"),
    }

    let waits = f.device.stats().waits;
    f.ctx.submit(cmd).expect("frame submission failed");
    assert_eq!(f.device.stats().waits, waits);
    assert!(!tlas.is_dirty());

    let after = read_instances(&f, &tlas);
    assert_eq!(after[..2], before[..2]);
    assert_eq!(after[2].transform, TransformMatrix::from_mat4(&translation(42.0)));

    let built = f.device.built_structure(tlas.handle().unwrap()).expect("no build");
    assert_eq!(built.updates, 1);
    assert_eq!(built.instances[2].transform.translation().x, 42.0);
}

#[test]
fn test_frames_alternate_staging_slots() {
    let f = fixture();
    let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
    tlas.add_instance_animated(&f.blas.instance_ref(), Box::new(|| translation(3.0)));
    tlas.create_or_update().expect("TLAS build failed");
    let instances = tlas.instance_buffer();
    assert_eq!(instances.staging_count(), 2);

    let mut sources = Vec::new();
    for frame in 0..4u64 {
        let mut cmd = CommandBuffer::new(format!("frame {frame}"));
        tlas.update_lean(&mut cmd, frame).expect("lean update failed");
        if let Command::CopyBuffer { src, .. } = &cmd.commands()[1] {
            sources.push(*src);
        }
        f.ctx.submit(cmd).expect("frame submission failed");
    }
    assert_eq!(sources.len(), 4);
    assert_ne!(sources[0], sources[1]);
    assert_eq!(sources[0], sources[2]);
    assert_eq!(sources[1], sources[3]);
    assert_eq!(f.device.stats().updates, 4);
}

#[test]
fn test_lean_update_leaves_topology_state_alone() {
    let f = fixture();
    let mut tlas = Tlas::new(&f.ctx, AccelConfig::default());
    tlas.add_instance_animated(&f.blas.instance_ref(), Box::new(|| translation(1.0)));
    tlas.create_or_update().expect("TLAS build failed");
    let address = tlas.device_address();

    let mut cmd = CommandBuffer::new("frame");
    tlas.update_lean(&mut cmd, 0).expect("lean update failed");
    f.ctx.submit(cmd).expect("frame submission failed");

    assert!(!tlas.is_dirty());
    assert_eq!(tlas.device_address(), address);
    let stats = f.device.stats();
    tlas.create_or_update().expect("no-op rebuild failed");
    assert_eq!(f.device.stats(), stats);
}
