//! Known call signatures per capability, highest priority first.
//!
//! Order matters: the probe takes the first variant the platform exposes.
//! Newer platform revisions come first.

use super::{Capability, Request, SignatureVariant};
use crate::platform::{ArgType, CallError, Value};

use ArgType::*;

pub(super) fn table(cap: Capability) -> &'static [SignatureVariant] {
    match cap {
        Capability::CreateVirtualOutput => CREATE_VIRTUAL_OUTPUT,
        Capability::DestroyVirtualOutput => DESTROY_VIRTUAL_OUTPUT,
        Capability::SetOutputSurface => SET_OUTPUT_SURFACE,
        Capability::InjectEvent => INJECT_EVENT,
        Capability::QueryWindowState => QUERY_WINDOW_STATE,
        Capability::AssertDisplayFocus => ASSERT_DISPLAY_FOCUS,
        Capability::FocusedDisplay => FOCUSED_DISPLAY,
        Capability::MoveTaskToDisplay => MOVE_TASK_TO_DISPLAY,
    }
}

fn mismatch(req: &Request<'_>) -> CallError {
    CallError::BadArguments(format!("request {req:?} does not fit this signature"))
}

// ── createVirtualOutput ──────────────────────────────────────────

static CREATE_VIRTUAL_OUTPUT: &[SignatureVariant] = &[
    SignatureVariant {
        service: "display",
        method: "createVirtualDisplay",
        params: &[DisplayConfig, DisplayCallback, MediaProjection, Str],
        returns: Int,
        encode: encode_create_config,
    },
    SignatureVariant {
        service: "display",
        method: "createVirtualDisplay",
        params: &[
            DisplayCallback,
            MediaProjection,
            Str,
            Str,
            Int,
            Int,
            Int,
            Surface,
            Int,
            Str,
        ],
        returns: Int,
        encode: encode_create_legacy,
    },
];

fn encode_create_config(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    let Request::CreateOutput {
        spec,
        token,
        owner_package,
    } = *req
    else {
        return Err(mismatch(req));
    };
    Ok(vec![
        Value::Config(Box::new(spec.clone())),
        Value::Callback(token),
        Value::Null,
        Value::Str(owner_package.to_string()),
    ])
}

fn encode_create_legacy(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    let Request::CreateOutput {
        spec,
        token,
        owner_package,
    } = *req
    else {
        return Err(mismatch(req));
    };
    Ok(vec![
        Value::Callback(token),
        Value::Null,
        Value::Str(owner_package.to_string()),
        Value::Str(spec.name.clone()),
        Value::Int(spec.width as i32),
        Value::Int(spec.height as i32),
        Value::Int(spec.dpi as i32),
        Value::Surface(spec.surface.clone()),
        Value::Int(spec.flags.bits() as i32),
        Value::Str(spec.unique_id.clone()),
    ])
}

// ── destroyVirtualOutput ─────────────────────────────────────────

static DESTROY_VIRTUAL_OUTPUT: &[SignatureVariant] = &[
    SignatureVariant {
        service: "display",
        method: "releaseVirtualDisplay",
        params: &[DisplayCallback],
        returns: Void,
        encode: encode_destroy_callback,
    },
    SignatureVariant {
        service: "display",
        method: "destroyVirtualDisplay",
        params: &[DisplayCallback],
        returns: Void,
        encode: encode_destroy_callback,
    },
    SignatureVariant {
        service: "display",
        method: "removeVirtualDisplay",
        params: &[DisplayCallback],
        returns: Void,
        encode: encode_destroy_callback,
    },
    SignatureVariant {
        service: "display",
        method: "releaseVirtualDisplay",
        params: &[Binder],
        returns: Void,
        encode: encode_destroy_binder,
    },
];

fn encode_destroy_callback(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::DestroyOutput { token } => Ok(vec![Value::Callback(token)]),
        _ => Err(mismatch(req)),
    }
}

fn encode_destroy_binder(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::DestroyOutput { token } => Ok(vec![Value::Binder(token)]),
        _ => Err(mismatch(req)),
    }
}

// ── setOutputSurface ─────────────────────────────────────────────

static SET_OUTPUT_SURFACE: &[SignatureVariant] = &[SignatureVariant {
    service: "display",
    method: "setVirtualDisplaySurface",
    params: &[DisplayCallback, Surface],
    returns: Void,
    encode: encode_set_surface,
}];

fn encode_set_surface(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::SetOutputSurface { token, endpoint } => Ok(vec![
            Value::Callback(token),
            Value::Surface(endpoint.cloned()),
        ]),
        _ => Err(mismatch(req)),
    }
}

// ── injectEvent ──────────────────────────────────────────────────

static INJECT_EVENT: &[SignatureVariant] = &[
    SignatureVariant {
        service: "input",
        method: "injectInputEvent",
        params: &[InputEvent, Int],
        returns: Bool,
        encode: encode_inject,
    },
    SignatureVariant {
        service: "input",
        method: "injectInputEvent",
        params: &[InputEvent, Int, Int],
        returns: Bool,
        encode: encode_inject_with_display,
    },
    SignatureVariant {
        service: "input",
        method: "injectInputEventToTarget",
        params: &[InputEvent, Int, Int],
        returns: Bool,
        encode: encode_inject_to_target,
    },
];

/// Target uid meaning "any window may receive the event".
const ANY_TARGET_UID: i32 = -1;

fn encode_inject(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::InjectEvent { event, mode, .. } => {
            Ok(vec![Value::Event(event.clone()), Value::Int(mode as i32)])
        }
        _ => Err(mismatch(req)),
    }
}

fn encode_inject_with_display(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::InjectEvent {
            event,
            display,
            mode,
        } => Ok(vec![
            Value::Event(event.clone()),
            Value::Int(display.get()),
            Value::Int(mode as i32),
        ]),
        _ => Err(mismatch(req)),
    }
}

fn encode_inject_to_target(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::InjectEvent { event, mode, .. } => Ok(vec![
            Value::Event(event.clone()),
            Value::Int(mode as i32),
            Value::Int(ANY_TARGET_UID),
        ]),
        _ => Err(mismatch(req)),
    }
}

// ── queryWindowState ─────────────────────────────────────────────

static QUERY_WINDOW_STATE: &[SignatureVariant] = &[
    SignatureVariant {
        service: "window",
        method: "dumpWindows",
        params: &[],
        returns: Str,
        encode: encode_query_plain,
    },
    SignatureVariant {
        service: "window",
        method: "dump",
        params: &[StrArray],
        returns: Str,
        encode: encode_query_dump,
    },
];

fn encode_query_plain(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::QueryWindowState => Ok(Vec::new()),
        _ => Err(mismatch(req)),
    }
}

fn encode_query_dump(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::QueryWindowState => Ok(vec![Value::StrArray(vec!["windows".into()])]),
        _ => Err(mismatch(req)),
    }
}

// ── assertDisplayFocus ───────────────────────────────────────────

static ASSERT_DISPLAY_FOCUS: &[SignatureVariant] = &[
    SignatureVariant {
        service: "input",
        method: "setFocusedDisplay",
        params: &[Int],
        returns: Void,
        encode: encode_assert_focus,
    },
    SignatureVariant {
        service: "window",
        method: "setFocusedDisplay",
        params: &[Int],
        returns: Void,
        encode: encode_assert_focus,
    },
];

fn encode_assert_focus(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::AssertFocus { display } => Ok(vec![Value::Int(display.get())]),
        _ => Err(mismatch(req)),
    }
}

// ── focusedDisplay ───────────────────────────────────────────────

static FOCUSED_DISPLAY: &[SignatureVariant] = &[
    SignatureVariant {
        service: "input",
        method: "getFocusedDisplayId",
        params: &[],
        returns: Int,
        encode: encode_focused_display,
    },
    SignatureVariant {
        service: "window",
        method: "getFocusedDisplayId",
        params: &[],
        returns: Int,
        encode: encode_focused_display,
    },
];

fn encode_focused_display(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::FocusedDisplay => Ok(Vec::new()),
        _ => Err(mismatch(req)),
    }
}

// ── moveTaskToDisplay ────────────────────────────────────────────

static MOVE_TASK_TO_DISPLAY: &[SignatureVariant] = &[
    SignatureVariant {
        service: "activity_task",
        method: "moveRootTaskToDisplay",
        params: &[Int, Int],
        returns: Void,
        encode: encode_move_task,
    },
    SignatureVariant {
        service: "activity_task",
        method: "moveStackToDisplay",
        params: &[Int, Int],
        returns: Void,
        encode: encode_move_task,
    },
    SignatureVariant {
        service: "activity_task",
        method: "moveTaskToDisplay",
        params: &[Int, Int],
        returns: Bool,
        encode: encode_move_task,
    },
];

fn encode_move_task(req: &Request<'_>) -> Result<Vec<Value>, CallError> {
    match *req {
        Request::MoveTask { task_id, display } => {
            Ok(vec![Value::Int(task_id), Value::Int(display.get())])
        }
        _ => Err(mismatch(req)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InjectMode;
    use crate::input::event::{InputEvent as Event, KeyAction};
    use crate::types::DisplayId;

    #[test]
    fn inject_variants_lay_out_display_and_mode() {
        let display = DisplayId::new(5).unwrap();
        let event = Event::key(KeyAction::Up, 4, 0, display);
        let req = Request::InjectEvent {
            event: &event,
            display,
            mode: InjectMode::Async,
        };

        let args = (INJECT_EVENT[0].encode)(&req).unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[1].as_int(), Some(0));

        let args = (INJECT_EVENT[1].encode)(&req).unwrap();
        assert_eq!(args[1].as_int(), Some(5));
        assert_eq!(args[2].as_int(), Some(0));

        let args = (INJECT_EVENT[2].encode)(&req).unwrap();
        assert_eq!(args[2].as_int(), Some(ANY_TARGET_UID));
    }

    #[test]
    fn encoder_rejects_foreign_request() {
        let err = (ASSERT_DISPLAY_FOCUS[0].encode)(&Request::QueryWindowState).unwrap_err();
        assert!(matches!(err, CallError::BadArguments(_)));
    }

    #[test]
    fn destroy_variants_share_the_callback_token() {
        use crate::platform::OutputToken;
        let req = Request::DestroyOutput {
            token: OutputToken(9),
        };
        for v in DESTROY_VIRTUAL_OUTPUT {
            let args = (v.encode)(&req).unwrap();
            assert_eq!(args[0].as_token(), Some(OutputToken(9)), "{v}");
        }
    }
}
