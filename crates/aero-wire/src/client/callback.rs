//! Callback descriptions passed to asynchronous client calls.

use aero_wire_protocol::{
    DeviceLostReason, ErrorType, MapAsyncStatus, PopErrorScopeStatus, QueueWorkDoneStatus,
    RequestAdapterStatus, RequestDeviceStatus,
};

use super::event::CallbackMode;
use super::objects::{Adapter, Device, UncapturedErrorCallback};
use super::WireClient;

macro_rules! callback_info {
    ($(#[$meta:meta])* $name:ident($($arg:ty),*)) => {
        $(#[$meta])*
        pub struct $name {
            pub mode: CallbackMode,
            pub callback: Box<dyn FnOnce(&mut WireClient, $($arg),*)>,
        }

        impl $name {
            pub fn new(
                mode: CallbackMode,
                callback: impl FnOnce(&mut WireClient, $($arg),*) + 'static,
            ) -> Self {
                Self {
                    mode,
                    callback: Box::new(callback),
                }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("mode", &self.mode)
                    .finish_non_exhaustive()
            }
        }
    };
}

callback_info!(
    /// Receives the adapter on success.
    RequestAdapterCallbackInfo(RequestAdapterStatus, Option<Adapter>, String)
);
callback_info!(
    /// Receives the device on success.
    RequestDeviceCallbackInfo(RequestDeviceStatus, Option<Device>, String)
);
callback_info!(MapAsyncCallbackInfo(MapAsyncStatus, String));
callback_info!(QueueWorkDoneCallbackInfo(QueueWorkDoneStatus, String));
callback_info!(PopErrorScopeCallbackInfo(PopErrorScopeStatus, ErrorType, String));
callback_info!(
    /// Fires once per device: when it is lost, destroyed, fails creation, or is released.
    DeviceLostCallbackInfo(Device, DeviceLostReason, String)
);

/// Device-lifetime callbacks registered with a device request.
pub struct DeviceCallbacks {
    pub lost: DeviceLostCallbackInfo,
    /// Invoked inline for every error the server reports outside an error scope.
    pub uncaptured_error: Option<UncapturedErrorCallback>,
}

impl DeviceCallbacks {
    pub fn new(lost: DeviceLostCallbackInfo) -> Self {
        Self {
            lost,
            uncaptured_error: None,
        }
    }

    pub fn with_uncaptured_error(
        mut self,
        callback: impl FnMut(Device, ErrorType, &str) + 'static,
    ) -> Self {
        self.uncaptured_error = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for DeviceCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCallbacks")
            .field("lost", &self.lost)
            .field("uncaptured_error", &self.uncaptured_error.is_some())
            .finish()
    }
}
