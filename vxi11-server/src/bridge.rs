use crate::CommandHandler;

/// Forwards decoded SCPI commands to the [`CommandHandler`].
///
/// The VXI-11 reply to a DEVICE_WRITE does not depend on the outcome of the command,
/// so failures end here and are only logged.
#[derive(Debug)]
pub struct CommandBridge<T: CommandHandler> {
    handler: T,
}

impl<T: CommandHandler> CommandBridge<T> {
    pub fn new(handler: T) -> CommandBridge<T> {
        CommandBridge { handler }
    }

    pub fn forward(&mut self, command: &str) {
        log::debug!("Forwarding command: {}", command);
        if let Err(e) = self.handler.execute(command) {
            log::warn!("Command '{}' failed: {}", command, e);
        }
    }

    pub fn handler(&self) -> &T {
        &self.handler
    }

    pub fn into_handler(self) -> T {
        self.handler
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::error::Error;

    #[derive(Default)]
    struct Flaky {
        calls: usize,
    }

    impl CommandHandler for Flaky {
        fn execute(&mut self, command: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.calls += 1;
            if command.starts_with("BAD") {
                return Err(format!("cannot execute {}", command).into());
            }
            Ok(())
        }
    }

    #[test]
    fn failures_are_swallowed() {
        let mut bridge = CommandBridge::new(Flaky::default());
        bridge.forward("BAD:CMD");
        bridge.forward("C1:OUTP ON");
        assert_eq!(bridge.into_handler().calls, 2);
    }
}
