use state_machines::state_machine;

state_machine! {
    name: IngestionMachine,
    state: IngestionState,
    initial: Ready,
    states: [Ready, Discovered, Selected, Processed, Finalized, Failed],
    events {
        discover { transition: { from: Ready, to: Discovered } }
        select { transition: { from: Discovered, to: Selected } }
        process { transition: { from: Selected, to: Processed } }
        finalize { transition: { from: Processed, to: Finalized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: Discovered, to: Failed }
            transition: { from: Selected, to: Failed }
            transition: { from: Processed, to: Failed }
            transition: { from: Finalized, to: Failed }
        }
    }
}

pub fn ready() -> IngestionMachine<(), Ready> {
    IngestionMachine::new(())
}
