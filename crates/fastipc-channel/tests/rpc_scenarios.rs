#![cfg(unix)]

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fastipc_channel::{
    CallSpec, Channel, ChannelConfig, ChannelError, Domain, FaultKind, MethodKey, Param,
    Registry, RemoteHandle, TypeKey, Value,
};
use fastipc_transport::{segment_name, Segment, TransportConfig};

#[derive(Default)]
struct Calculator {
    calls: AtomicI32,
    kept: Mutex<Value>,
}

#[derive(Default)]
struct Factory {
    made: Mutex<Vec<Arc<Widget>>>,
}

struct Widget {
    label: String,
}

struct Api {
    registry: Arc<Registry>,
    calculator: TypeKey,
    factory: TypeKey,
    widget: TypeKey,
    add: MethodKey,
    echo: MethodKey,
    slow_add: MethodKey,
    stall: MethodKey,
    fail: MethodKey,
    explode: MethodKey,
    keep: MethodKey,
    kept: MethodKey,
    calls: MethodKey,
    make: MethodKey,
    is_same: MethodKey,
}

/// Both sides build this in the same order, as two processes would.
fn api() -> Api {
    let mut builder = Registry::builder();
    let calculator = builder.add_type::<Calculator>("calc", "calc::Calculator");
    let factory = builder.add_type::<Factory>("calc", "calc::Factory");
    let widget = builder.add_type::<Widget>("calc", "calc::Widget");
    builder
        .activator(calculator, Calculator::default)
        .activator(factory, Factory::default);

    let add = builder.method::<Calculator, _>(
        calculator,
        "add",
        &[Param::Any, Param::Any],
        Param::Any,
        |calc, args| {
            calc.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int32(args.int32(0)? + args.int32(1)?))
        },
    );
    let echo = builder.method::<Calculator, _>(
        calculator,
        "echo",
        &[Param::Any],
        Param::Any,
        |_, args| Ok(args.get(0)?.clone()),
    );
    let slow_add = builder.async_method::<Calculator, _, _>(
        calculator,
        "slow_add",
        &[Param::Any, Param::Any],
        Param::Any,
        |calc, args| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            calc.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Int32(args.int32(0)? + args.int32(1)?))
        },
    );
    let stall = builder.async_method::<Calculator, _, _>(
        calculator,
        "stall",
        &[],
        Param::Any,
        |_, _| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        },
    );
    let fail = builder.method::<Calculator, _>(calculator, "fail", &[], Param::Any, |_, _| {
        Err(ChannelError::application("boom"))
    });
    let explode = builder.method::<Calculator, _>(calculator, "explode", &[], Param::Any, |_, _| {
        panic!("kaboom")
    });
    let keep = builder.method::<Calculator, _>(
        calculator,
        "keep",
        &[Param::Any],
        Param::Any,
        |calc, args| {
            *calc.kept.lock().unwrap() = args.get(0)?.clone();
            Ok(Value::Null)
        },
    );
    let kept = builder.property::<Calculator, _>(calculator, "kept", Param::Any, |calc| {
        Ok(calc.kept.lock().unwrap().clone())
    });
    let calls = builder.property::<Calculator, _>(calculator, "calls", Param::Any, |calc| {
        Ok(Value::Int32(calc.calls.load(Ordering::SeqCst)))
    });
    let make = builder.method::<Factory, _>(
        factory,
        "make",
        &[Param::Any],
        Param::Object(widget),
        |factory, args| {
            let widget = Arc::new(Widget {
                label: args.string(0)?.to_string(),
            });
            factory.made.lock().unwrap().push(Arc::clone(&widget));
            Ok(Value::Instance(widget))
        },
    );
    let is_same = builder.method::<Factory, _>(
        factory,
        "is_same",
        &[Param::Object(widget)],
        Param::Any,
        |factory, args| {
            let widget = args.instance::<Widget>(0)?;
            let made = factory.made.lock().unwrap();
            Ok(Value::Bool(made.iter().any(|w| Arc::ptr_eq(w, &widget))))
        },
    );

    Api {
        registry: builder.build().expect("registry"),
        calculator,
        factory,
        widget,
        add,
        echo,
        slow_add,
        stall,
        fail,
        explode,
        keep,
        kept,
        calls,
        make,
        is_same,
    }
}

fn unique_name(tag: &str) -> String {
    format!(
        "fastipc-rpc-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    )
}

fn pair(api: &Api, tag: &str, config: ChannelConfig) -> (Channel, Channel) {
    let name = unique_name(tag);
    let owner = Channel::open(&name, Domain::Owner, Arc::clone(&api.registry), config.clone())
        .expect("owner should open");
    let guest = Channel::open(&name, Domain::Guest, Arc::clone(&api.registry), config)
        .expect("guest should attach");
    (owner, guest)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn fault_kind(err: &ChannelError) -> Option<FaultKind> {
    match err {
        ChannelError::Remote(fault) => Some(fault.kind),
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_call_returns_sum() {
    let api = api();
    let (owner, guest) = pair(&api, "sum", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    assert!(!calc.is_local());
    assert_eq!(calc.domain(), Some(Domain::Guest));
    assert_eq!(calc.actual_type(), Some(api.calculator));

    let sum = calc
        .eval(CallSpec::method(api.add, [Value::Int32(2), Value::Int32(3)]))
        .await
        .expect("add should succeed");
    assert_eq!(sum.as_i32(), Some(5));

    assert_eq!(owner.messages_received(), 2);
    assert_eq!(guest.messages_received(), 2);
    assert_eq!(owner.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn module_tokens_carry_calls() {
    let api = api();
    let (owner, _guest) = pair(&api, "tok", ChannelConfig::new().with_module("calc"));

    let calc = owner.activate(api.calculator).await.expect("activation");
    calc.run(CallSpec::method(api.add, [Value::Int32(1), Value::Int32(1)]))
        .await
        .expect("add should succeed");
    let calls = calc
        .eval(CallSpec::property(api.calls))
        .await
        .expect("property read");
    assert_eq!(calls.as_i32(), Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn async_result_is_awaited() {
    let api = api();
    let (owner, _guest) = pair(&api, "async", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let sum = calc
        .eval(CallSpec::method(api.slow_add, [Value::Int32(3), Value::Int32(4)]))
        .await
        .expect("slow_add should succeed");
    assert_eq!(sum.as_i32(), Some(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn returned_reference_resolves_to_original_instance() {
    let api = api();
    let (owner, guest) = pair(&api, "ident", ChannelConfig::default());

    // Peer-hosted object handed back to its host.
    let factory = owner.activate(api.factory).await.expect("activation");
    let widget = factory
        .eval(CallSpec::method(api.make, [Value::from("gear")]))
        .await
        .expect("make")
        .into_handle()
        .expect("make returns a reference");
    assert!(!widget.is_local());
    assert_eq!(widget.actual_type(), Some(api.widget));
    assert_eq!(guest.hosted_objects(), 2);

    let same = factory
        .eval(CallSpec::method(api.is_same, [Value::Handle(widget.clone())]))
        .await
        .expect("is_same");
    assert_eq!(same.as_bool(), Some(true));

    // Local object sent to the peer and read back.
    let calc = owner.activate(api.calculator).await.expect("activation");
    let original = Arc::new(Widget {
        label: "local".to_string(),
    });
    let local = RemoteHandle::new(&api.registry, original.clone()).expect("registered type");
    calc.run(CallSpec::method(api.keep, [Value::Handle(local.clone())]))
        .await
        .expect("keep");
    assert_eq!(owner.hosted_objects(), 1);

    let back = calc
        .eval(CallSpec::property(api.kept))
        .await
        .expect("kept");
    let back = back.into_handle().expect("kept returns a reference");
    assert!(back.same_identity(&local));
    let instance = back.local_instance::<Widget>().expect("hosted here");
    assert!(Arc::ptr_eq(&instance, &original));
    assert_eq!(instance.label, "local");
}

#[tokio::test(flavor = "multi_thread")]
async fn deactivated_object_reports_disposed() {
    let api = api();
    let (owner, guest) = pair(&api, "deact", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let object_id = calc.object_id().expect("remote handles have an id");
    assert_eq!(guest.hosted_objects(), 1);

    calc.disconnect();
    wait_until(|| guest.hosted_objects() == 0).await;

    let err = owner
        .call(object_id, api.add, vec![Value::Int32(1), Value::Int32(2)])
        .await
        .unwrap_err();
    assert_eq!(fault_kind(&err), Some(FaultKind::DisposedObject));
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_last_handle_releases_peer_object() {
    let api = api();
    let (owner, guest) = pair(&api, "drop", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let clone = calc.clone();
    drop(calc);
    assert!(!clone.is_disconnected());
    assert_eq!(guest.hosted_objects(), 1);

    drop(clone);
    wait_until(|| guest.hosted_objects() == 0).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registering_twice_coalesces() {
    let api = api();
    let (owner, _guest) = pair(&api, "reg", ChannelConfig::default());

    let instance = Arc::new(Widget {
        label: "w".to_string(),
    });
    let first = RemoteHandle::new(&api.registry, instance.clone()).expect("registered type");
    let second = RemoteHandle::new(&api.registry, instance).expect("registered type");

    let id_a = owner.register(&first).expect("register");
    let id_b = owner.register(&second).expect("register");
    assert_eq!(id_a, id_b);
    assert_eq!(owner.register(&first).expect("register"), id_a);
    assert_eq!(owner.hosted_objects(), 1);
    assert_eq!(second.object_id(), Some(id_a));
    assert_eq!(second.domain(), Some(Domain::Owner));
}

#[tokio::test(flavor = "multi_thread")]
async fn reregistration_after_release_rebinds_handle() {
    let api = api();
    let (owner, _guest) = pair(&api, "rebind", ChannelConfig::default());

    let instance = Arc::new(Widget {
        label: "w".to_string(),
    });
    let first = RemoteHandle::new(&api.registry, instance.clone()).expect("registered type");
    let second = RemoteHandle::new(&api.registry, instance).expect("registered type");
    let old_id = owner.register(&first).expect("register");
    assert_eq!(owner.register(&second).expect("register"), old_id);

    first.disconnect();
    assert_eq!(owner.hosted_objects(), 0);

    let new_id = owner.register(&second).expect("register");
    assert_ne!(new_id, old_id);
    assert_eq!(second.object_id(), Some(new_id));
    assert_eq!(owner.hosted_objects(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn object_ids_are_unique_across_channels() {
    let api = api();
    let (first_owner, _first_guest) = pair(&api, "ids-a", ChannelConfig::default());
    let (second_owner, _second_guest) = pair(&api, "ids-b", ChannelConfig::default());

    let a = RemoteHandle::new(
        &api.registry,
        Arc::new(Widget {
            label: "a".to_string(),
        }),
    )
    .expect("registered type");
    let b = RemoteHandle::new(
        &api.registry,
        Arc::new(Widget {
            label: "b".to_string(),
        }),
    )
    .expect("registered type");

    let id_a = first_owner.register(&a).expect("register");
    let id_b = second_owner.register(&b).expect("register");
    assert_ne!(id_a, id_b);
}

#[tokio::test(flavor = "multi_thread")]
async fn byte_char_and_generic_values_cross_unchanged() {
    let api = api();
    let (owner, _guest) = pair(&api, "values", ChannelConfig::default());
    let calc = owner.activate(api.calculator).await.expect("activation");

    let byte = calc
        .eval(CallSpec::method(api.echo, [Value::Byte(9)]))
        .await
        .expect("echo byte");
    assert!(matches!(byte, Value::Byte(9)));

    let ch = calc
        .eval(CallSpec::method(api.echo, [Value::Char('λ')]))
        .await
        .expect("echo char");
    assert!(matches!(ch, Value::Char('λ')));

    let generic = serde_json::json!({"a": [1, 2]});
    let other = calc
        .eval(CallSpec::method(api.echo, [Value::Other(generic.clone())]))
        .await
        .expect("echo other");
    match other {
        Value::Other(back) => assert_eq!(back, generic),
        other => panic!("unexpected value: {other:?}"),
    }

    let null = calc
        .eval(CallSpec::method(api.echo, [Value::Null]))
        .await
        .expect("echo null");
    assert!(null.is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn reference_to_released_object_fails_as_disposed() {
    let api = api();
    let (owner, _guest) = pair(&api, "stale", ChannelConfig::default());
    let calc = owner.activate(api.calculator).await.expect("activation");

    let local = RemoteHandle::new(
        &api.registry,
        Arc::new(Widget {
            label: "gone".to_string(),
        }),
    )
    .expect("registered type");
    calc.run(CallSpec::method(api.keep, [Value::Handle(local.clone())]))
        .await
        .expect("keep");
    assert_eq!(owner.hosted_objects(), 1);

    // The peer still holds a reference to the released object.
    local.disconnect();
    assert_eq!(owner.hosted_objects(), 0);

    let err = calc
        .eval(CallSpec::property(api.kept))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::DisposedObject(_)), "{err:?}");
    assert_eq!(owner.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_is_idempotent_and_terminal() {
    let api = api();
    let (owner, _guest) = pair(&api, "disc", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    calc.disconnect();
    calc.disconnect();
    assert!(calc.is_disconnected());
    assert_eq!(calc.object_id(), None);

    let err = calc
        .eval(CallSpec::method(api.add, [Value::Int32(1), Value::Int32(1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Disconnected));
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_failures_keep_kind_and_message() {
    let api = api();
    let (owner, _guest) = pair(&api, "fault", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let err = calc.eval(CallSpec::method(api.fail, [])).await.unwrap_err();
    match err {
        ChannelError::Remote(fault) => {
            assert_eq!(fault.kind, FaultKind::Application);
            assert_eq!(fault.message, "boom");
        }
        other => panic!("unexpected error {other:?}"),
    }

    let err = calc
        .eval(CallSpec::method(api.explode, []))
        .await
        .unwrap_err();
    assert_eq!(fault_kind(&err), Some(FaultKind::Application));

    let err = calc
        .eval(CallSpec::method(api.add, [Value::from("x"), Value::Int32(1)]))
        .await
        .unwrap_err();
    assert_eq!(fault_kind(&err), Some(FaultKind::InvalidArgument));

    // The channel keeps serving after faults.
    let sum = calc
        .eval(CallSpec::method(api.add, [Value::Int32(20), Value::Int32(22)]))
        .await
        .expect("add after faults");
    assert_eq!(sum.as_i32(), Some(42));
}

#[tokio::test(flavor = "multi_thread")]
async fn activation_without_activator_fails() {
    let api = api();
    let (owner, _guest) = pair(&api, "noact", ChannelConfig::default());

    let err = owner.activate(api.widget).await.unwrap_err();
    assert_eq!(fault_kind(&err), Some(FaultKind::Activation));
}

#[tokio::test(flavor = "multi_thread")]
async fn cast_checks_actual_type() {
    let api = api();
    let (owner, _guest) = pair(&api, "cast", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let err = calc.cast_to(api.factory).unwrap_err();
    assert!(matches!(err, ChannelError::Cast { .. }));

    let same = calc.cast_to(api.calculator).expect("identity cast");
    assert!(same.same_identity(&calc));
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_expiry_clears_pending_call() {
    let api = api();
    let (owner, _guest) = pair(&api, "dead", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let err = calc
        .eval_with_deadline(CallSpec::method(api.stall, []), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout(_)));
    assert_eq!(owner.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_timeout_applies_to_every_call() {
    let api = api();
    let config = ChannelConfig::new().with_call_timeout(Duration::from_millis(250));
    let (owner, _guest) = pair(&api, "ctmo", config);

    let calc = owner.activate(api.calculator).await.expect("activation");
    let err = calc.eval(CallSpec::method(api.stall, [])).await.unwrap_err();
    assert!(matches!(err, ChannelError::Timeout(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn dispose_abandons_waiting_calls() {
    let api = api();
    let (owner, _guest) = pair(&api, "aband", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let stall = api.stall;
    let call = tokio::spawn({
        let calc = calc.clone();
        async move { calc.eval(CallSpec::method(stall, [])).await }
    });
    wait_until(|| owner.pending_calls() == 1).await;

    owner.dispose();
    let err = call.await.expect("task").unwrap_err();
    assert!(matches!(err, ChannelError::ChannelClosed));
    assert_eq!(owner.pending_calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn broken_inbound_fails_waiting_calls_and_closes() {
    let api = api();
    let config = ChannelConfig::new().with_transport(TransportConfig {
        open_timeout: Duration::from_millis(100),
        ..TransportConfig::default()
    });
    let name = unique_name("broken");
    let owner = Channel::open(&name, Domain::Owner, Arc::clone(&api.registry), config.clone())
        .expect("owner should open");
    let _guest = Channel::open(&name, Domain::Guest, Arc::clone(&api.registry), config)
        .expect("guest should attach");

    let calc = owner.activate(api.calculator).await.expect("activation");
    let stall = api.stall;
    let call = tokio::spawn({
        let calc = calc.clone();
        async move { calc.eval(CallSpec::method(stall, [])).await }
    });
    wait_until(|| owner.pending_calls() == 1).await;

    // Publish a frame that was never written: the owner's reader takes it for
    // a hand-off to a segment that does not exist and stops.
    let base = format!("{name}{}", Domain::Owner.inbound_suffix());
    let segment = Segment::open(&segment_name(&base, 0)).expect("inbound segment");
    let counter = segment.publish_counter().expect("counter");
    segment.publish(counter.wrapping_add(1)).expect("publish");

    let err = call.await.expect("task").unwrap_err();
    assert!(matches!(err, ChannelError::TransportFailed(_)), "{err:?}");
    wait_until(|| owner.is_disposed()).await;
    assert_eq!(owner.pending_calls(), 0);

    assert!(calc
        .eval(CallSpec::method(api.add, [Value::Int32(1), Value::Int32(1)]))
        .await
        .is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn many_concurrent_calls_complete() {
    let api = api();
    let (owner, _guest) = pair(&api, "many", ChannelConfig::default());

    let calc = owner.activate(api.calculator).await.expect("activation");
    let add = api.add;
    let tasks: Vec<_> = (0..64i32)
        .map(|i| {
            let calc = calc.clone();
            tokio::spawn(async move {
                calc.eval(CallSpec::method(add, [Value::Int32(i), Value::Int32(i)]))
                    .await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let sum = task.await.expect("task").expect("add");
        assert_eq!(sum.as_i32(), Some(2 * i as i32));
    }
    let calls = calc
        .eval(CallSpec::property(api.calls))
        .await
        .expect("property read");
    assert_eq!(calls.as_i32(), Some(64));
}
