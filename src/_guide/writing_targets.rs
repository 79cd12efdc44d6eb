/*!

# Writing and Instrumenting Targets

A [`Target`][crate::invoke::Target] is a name, the kinds of its parameters, and
a closure over a slice of [`Value`][crate::Value]s. The fuzzer checks every
tuple against the declared kinds before calling the closure; when the very
first tuple does not match, fuzzing stops right away with
[`ErrorKind::FirstRunFailed`][crate::ErrorKind::FirstRunFailed], since nothing
useful can come of a harness whose generators disagree with its target.

A target reports failure by returning `Err` or by panicking. Both are recorded
in the [`ExecutionResult`][crate::invoke::ExecutionResult] and fuzzing carries
on; deciding which failures matter is the job of a
[`PostSubmission`][crate::fuzzer::PostSubmission] hook.

## Reporting Branches

The engine learns nothing from a target it cannot observe. With
[`ManualTracer`][crate::tracer::ManualTracer], the target reports each branch
it takes. Register a unit per function up front, then report an edge between
two offsets of your choosing whenever control flow splits:

```rust
use covfuzz::{
    invoke::Target,
    tracer::ManualTracer,
    Value, ValueKind,
};
use std::sync::Arc;

let tracer = Arc::new(ManualTracer::new());
let unit = tracer.unit("shapes", "classify");

let target = {
    let tracer = tracer.clone();
    Target::new("classify", vec![ValueKind::I32, ValueKind::I32], move |args| {
        let [Value::I32(w), Value::I32(h)] = args else {
            return Err("expected two integers".into());
        };
        let shape = if w == h {
            tracer.branch(unit, 0, 1);
            "square"
        } else if *w > 1000 || *h > 1000 {
            tracer.branch(unit, 0, 2);
            "huge"
        } else {
            tracer.branch(unit, 0, 3);
            "rectangle"
        };
        Ok(Value::Str(shape.into()))
    })
};
# let _ = target;
```

Reports from threads that are not currently being traced are dropped, so the
same instrumented code can run outside the fuzzer.

## Custom Tracers

Anything that can tell which edges a thread took can implement
[`Tracer`][crate::tracer::Tracer]. Edges whose `from_id` and `from_offset` are
both `-1` are ignored, which lets a tracer mark slots it did not fill. Unit
ids are turned into names by a
[`SymbolResolver`][crate::coverage::SymbolResolver]; wrap slow resolvers in a
[`CachedResolver`][crate::coverage::CachedResolver] so each id is only resolved
once per run.

 */
