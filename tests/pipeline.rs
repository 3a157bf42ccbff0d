//! End-to-end runs of the policing scenario: an IPv4 packet to 10.0.0.0/24
//! is policed at 1 Mbit and classified into class 1:1 while it conforms.

use std::path::PathBuf;

use clax::{
    compile, compile_rules, conform, count, field, meta, run_rules, Bucket, BucketId, BucketSim,
    ClassRef, CompilationContext, Decision, DiagramVariant, Expr, HardwareAction, MetaField,
    OffsetGroups, Output, Packet, RecordNext, Target, PROTO_IPV4,
};

fn scenario(ctx: &mut CompilationContext) -> (Expr, BucketId) {
    let b = ctx.buckets.intern(Bucket {
        rate: 125_000,
        mpu: 0,
        burst: 6000,
        overflow: None,
    });
    let e = meta(MetaField::Protocol)
        .eq(PROTO_IPV4)
        .and(
            field(OffsetGroups::PACKET, 16, 4)
                .mask(0xffff_ff00_u32)
                .eq(0x0a00_0000_u32),
        )
        .and(count(b))
        .and(conform(b));
    (e, b)
}

/// A minimal 20-byte IPv4 header addressed to 10.0.0.x.
fn ipv4_to(host: u8) -> Packet {
    let mut data = vec![0_u8; 20];
    data[0] = 0x45;
    data[16..20].copy_from_slice(&[10, 0, 0, host]);
    Packet::new(data).with_protocol(PROTO_IPV4 as u16)
}

#[test]
fn scenario_classifies_until_the_bucket_drains() {
    for variant in [None, Some(DiagramVariant::TailMerge)] {
        let mut ctx = CompilationContext::new();
        let (e, b) = scenario(&mut ctx);
        let rules =
            compile_rules(e, Decision::Class(ClassRef::new(1, 1)), variant, &mut ctx).unwrap();

        let mut sim = BucketSim::new(&ctx.buckets);
        // Count runs before the conformance test, so a 6000-byte burst
        // admits 299 of these 20-byte packets into class 1:1.
        for i in 0..299 {
            let out = run_rules(&rules, &ipv4_to(7), &ctx, &mut sim).unwrap();
            assert_eq!(out.decision, Decision::Class(ClassRef::new(1, 1)), "{i}");
            assert_eq!(out.fired, vec![b]);
        }
        // The bucket is empty: still counted, no longer classified.
        let out = run_rules(&rules, &ipv4_to(7), &ctx, &mut sim).unwrap();
        assert_eq!(out.decision, Decision::Continue);
        assert_eq!(out.fired, vec![b]);

        // Off-prefix and non-IPv4 traffic never touches the bucket.
        let mut sim = BucketSim::new(&ctx.buckets);
        let mut miss = ipv4_to(7);
        miss.data[16] = 192;
        let out = run_rules(&rules, &miss, &ctx, &mut sim).unwrap();
        assert_eq!(out.decision, Decision::Continue);
        assert!(out.fired.is_empty());
        let other = ipv4_to(7).with_protocol(0x86dd);
        let out = run_rules(&rules, &other, &ctx, &mut sim).unwrap();
        assert_eq!(out.decision, Decision::Continue);
        assert!(out.fired.is_empty());
    }
}

#[test]
fn scenario_lowers_to_a_hardware_policing_chain() {
    // The hardware target carries a single policing stage, so the rate limit
    // is expressed as a bare conformance test.
    let mut ctx = CompilationContext::new();
    let b = ctx.buckets.intern(Bucket {
        rate: 125_000,
        mpu: 0,
        burst: 6000,
        overflow: None,
    });
    let e = meta(MetaField::Protocol)
        .eq(PROTO_IPV4)
        .and(
            field(OffsetGroups::PACKET, 16, 4)
                .mask(0xffff_ff00_u32)
                .eq(0x0a00_0000_u32),
        )
        .and(conform(b));
    let target = Target::Hardware { diagram: None };
    let out = compile(e, Decision::Class(ClassRef::new(1, 1)), &target, &mut ctx).unwrap();
    let Output::Hardware(program) = out else {
        panic!("expected a hardware program");
    };

    // Protocol match becomes dispatch, not a key field.
    assert_eq!(program.dispatch.len(), 1);
    assert_eq!(program.dispatch[0].protocol, PROTO_IPV4 as u16);
    let arm = program.dispatch[0].table;
    assert_ne!(arm, program.default_table);

    // The /24 prefix is 24 masked bits against a 16-bit key: follow the
    // record chain from the dispatch arm to its policing terminal.
    let mut record = program
        .records
        .iter()
        .find(|r| r.table == arm && !r.fields.is_empty())
        .unwrap();
    let action = loop {
        match &record.next {
            RecordNext::Table(t) => {
                record = program.records.iter().find(|r| r.table == *t).unwrap();
            }
            RecordNext::Action(a) => break a,
        }
    };
    match action {
        HardwareAction::Police {
            conform, exceed, ..
        } => {
            assert_eq!(**conform, HardwareAction::Class(ClassRef::new(1, 1)));
            assert_eq!(**exceed, HardwareAction::Unspec);
        }
        other => panic!("expected a policing terminal, got {other:?}"),
    }
}

#[test]
fn scenario_renders_c_source() {
    let mut ctx = CompilationContext::new();
    let (e, _) = scenario(&mut ctx);
    let target = Target::Codegen { diagram: None };
    let out = compile(e, Decision::Class(ClassRef::new(1, 1)), &target, &mut ctx).unwrap();
    let Output::Source(source) = out else {
        panic!("expected generated source");
    };
    assert!(source.contains("int clax_classify"), "{source}");
    assert!(source.contains("clax_buckets"), "{source}");
    assert!(source.contains("clax_read(meta + 0 + 0, 2)"), "{source}");
}

#[test]
fn external_builder_round_trip() {
    // `cat` stands in for a builder that accepts everything.
    let mut ctx = CompilationContext::new();
    let (e, _) = scenario(&mut ctx);
    let target = Target::External {
        program: Some(PathBuf::from("/bin/cat")),
        diagram: None,
    };
    let out = compile(e, Decision::Class(ClassRef::new(1, 1)), &target, &mut ctx).unwrap();
    let Output::Response { request, response } = out else {
        panic!("expected a builder response");
    };
    assert_eq!(request, response);
}
