use std::collections::BTreeMap;

use crate::command::{CommandBatch, CommandedState, OutletCommand};
use crate::core::time::{DateTime, Duration};
use crate::outlet::{ChannelId, OutletState};

#[derive(Debug, Clone, Default)]
pub struct CommandSchedule {
    channels: BTreeMap<ChannelId, Vec<OutletCommand>>,
}

impl CommandSchedule {
    pub fn new(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            channels: channels.into_iter().map(|channel| (channel, vec![])).collect(),
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    pub fn commands(&self, channel: ChannelId) -> &[OutletCommand] {
        self.channels.get(&channel).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn snapshot(&self) -> CommandBatch {
        self.channels.clone()
    }

    pub fn ingest(&mut self, batch: CommandBatch, now: DateTime) {
        for (channel, incoming) in batch {
            let Some(existing) = self.channels.get_mut(&channel) else {
                tracing::warn!("Ignoring commands for unknown channel {}", channel);
                continue;
            };

            let incoming = normalize(incoming);
            warn_invalid(channel, &incoming);

            let Some(first) = incoming.first() else {
                continue;
            };

            let retained = existing.partition_point(|cmd| cmd.time < first.time);
            existing.truncate(retained);
            existing.extend(incoming);

            let tail = existing.len() - 1;
            for cmd in &mut existing[..tail] {
                cmd.is_last = false;
            }

            tracing::debug!("Channel {} has {} scheduled commands", channel, existing.len());
        }

        self.prune(now);
    }

    /// Drops windows that ended before `now`. An entry is dead once both its
    /// own start and the next entry's start have passed.
    pub fn prune(&mut self, now: DateTime) {
        for commands in self.channels.values_mut() {
            let dead = commands
                .windows(2)
                .take_while(|pair| pair[0].time <= now && pair[1].time <= now)
                .count();

            if dead > 0 {
                commands.drain(..dead);
            }
        }
    }

    pub fn refresh_hint(&self, now: DateTime, lead_time: Duration) -> Option<DateTime> {
        self.channels
            .values()
            .filter_map(|commands| match commands.last() {
                None => Some(now),
                Some(tail) if tail.is_last => None,
                Some(tail) => Some(tail.time - lead_time),
            })
            .min()
    }

    pub fn active_command(&self, channel: ChannelId, now: DateTime) -> Option<&OutletCommand> {
        let commands = self.commands(channel);
        let started = commands.partition_point(|cmd| cmd.time <= now);

        started.checked_sub(1).map(|index| &commands[index])
    }

    pub fn desired_state(&self, channel: ChannelId, now: DateTime) -> OutletState {
        match self.active_command(channel, now).map(|cmd| &cmd.state) {
            Some(CommandedState::On) => OutletState::On,
            Some(CommandedState::Off) | None => OutletState::Off,
            Some(CommandedState::Invalid(value)) => {
                tracing::debug!("Channel {} has a command with unknown state {}, switching off", channel, value);
                OutletState::Off
            }
        }
    }
}

fn warn_invalid(channel: ChannelId, commands: &[OutletCommand]) -> usize {
    let mut count = 0;
    for cmd in commands {
        if let CommandedState::Invalid(value) = &cmd.state {
            tracing::warn!("Channel {} received a command at {} with unknown state {}, it will switch off", channel, cmd.time, value);
            count += 1;
        }
    }

    count
}

fn normalize(mut commands: Vec<OutletCommand>) -> Vec<OutletCommand> {
    commands.sort_by_key(|cmd| cmd.time);

    let mut result: Vec<OutletCommand> = Vec::with_capacity(commands.len());
    for cmd in commands {
        match result.last_mut() {
            Some(previous) if previous.time == cmd.time => *previous = cmd,
            _ => result.push(cmd),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::t;
    use proptest::prelude::*;

    const CHANNEL: ChannelId = ChannelId::new(1);

    fn at(millis: i64) -> DateTime {
        DateTime::from_millis(millis)
    }

    fn on(millis: i64) -> OutletCommand {
        OutletCommand::new(at(millis), OutletState::On)
    }

    fn off(millis: i64) -> OutletCommand {
        OutletCommand::new(at(millis), OutletState::Off)
    }

    fn schedule_with(commands: Vec<OutletCommand>) -> CommandSchedule {
        let mut schedule = CommandSchedule::new([CHANNEL, ChannelId::new(2)]);
        schedule.ingest(CommandBatch::from([(CHANNEL, commands)]), DateTime::MIN);
        schedule
    }

    fn times(schedule: &CommandSchedule) -> Vec<i64> {
        schedule.commands(CHANNEL).iter().map(|cmd| cmd.time.millis()).collect()
    }

    #[test]
    fn first_ingest_adopts_commands() {
        let schedule = schedule_with(vec![on(100), off(200)]);

        assert_eq!(schedule.commands(CHANNEL), &[on(100), off(200)]);
        assert!(schedule.commands(ChannelId::new(2)).is_empty());
    }

    #[test]
    fn resolves_active_window() {
        let schedule = schedule_with(vec![on(100), off(200)]);

        assert_eq!(schedule.desired_state(CHANNEL, at(150)), OutletState::On);
        assert_eq!(schedule.desired_state(CHANNEL, at(200)), OutletState::Off);
        assert_eq!(schedule.desired_state(CHANNEL, at(250)), OutletState::Off);
    }

    #[test]
    fn off_before_first_window_and_without_commands() {
        let schedule = schedule_with(vec![on(100)]);

        assert_eq!(schedule.desired_state(CHANNEL, at(99)), OutletState::Off);
        assert_eq!(schedule.desired_state(CHANNEL, at(100)), OutletState::On);
        assert_eq!(schedule.desired_state(ChannelId::new(2), at(100)), OutletState::Off);
    }

    #[test]
    fn invalid_state_resolves_to_off() {
        let invalid = OutletCommand {
            time: at(100),
            state: CommandedState::Invalid(serde_json::json!("DIMMED")),
            is_last: false,
        };
        let schedule = schedule_with(vec![on(50), invalid]);

        assert_eq!(schedule.desired_state(CHANNEL, at(75)), OutletState::On);
        assert_eq!(schedule.desired_state(CHANNEL, at(150)), OutletState::Off);
    }

    #[test]
    fn counts_invalid_commands_once_per_ingest() {
        let invalid = OutletCommand {
            time: at(100),
            state: CommandedState::Invalid(serde_json::json!("DIMMED")),
            is_last: false,
        };

        assert_eq!(warn_invalid(CHANNEL, &[on(50), invalid.clone(), off(150)]), 1);
        assert_eq!(warn_invalid(CHANNEL, &[on(50), off(150)]), 0);
    }

    #[test]
    fn incoming_commands_supersede_later_existing_ones() {
        let mut schedule = schedule_with(vec![on(10), off(100)]);

        schedule.ingest(CommandBatch::from([(CHANNEL, vec![on(50)])]), at(40));

        assert_eq!(schedule.commands(CHANNEL), &[on(10), on(50)]);
    }

    #[test]
    fn incoming_commands_are_appended_after_existing_ones() {
        let mut schedule = schedule_with(vec![on(10), off(100)]);

        schedule.ingest(CommandBatch::from([(CHANNEL, vec![on(150), off(200)])]), at(0));

        assert_eq!(times(&schedule), vec![10, 100, 150, 200]);
    }

    #[test]
    fn only_tail_keeps_last_marker() {
        let mut schedule = schedule_with(vec![on(10), off(100).last()]);

        schedule.ingest(CommandBatch::from([(CHANNEL, vec![on(150), off(200).last()])]), at(0));

        let markers: Vec<bool> = schedule.commands(CHANNEL).iter().map(|cmd| cmd.is_last).collect();
        assert_eq!(markers, vec![false, false, false, true]);
    }

    #[test]
    fn unordered_input_is_sorted_and_duplicates_collapse() {
        let schedule = schedule_with(vec![off(300), on(100), on(200), off(100)]);

        assert_eq!(schedule.commands(CHANNEL), &[off(100), on(200), off(300)]);
    }

    #[test]
    fn empty_and_unknown_channels_are_ignored() {
        let mut schedule = schedule_with(vec![on(10), off(100)]);

        schedule.ingest(
            CommandBatch::from([(CHANNEL, vec![]), (ChannelId::new(99), vec![on(5)])]),
            at(0),
        );

        assert_eq!(times(&schedule), vec![10, 100]);
        assert!(schedule.commands(ChannelId::new(99)).is_empty());
    }

    #[test]
    fn prune_keeps_currently_active_entry() {
        let mut schedule = schedule_with(vec![on(10), off(20), on(30), off(40)]);

        schedule.prune(at(35));

        assert_eq!(times(&schedule), vec![30, 40]);
    }

    #[test]
    fn prune_keeps_single_past_tail() {
        let mut schedule = schedule_with(vec![on(10), off(20)]);

        schedule.prune(at(1_000));

        assert_eq!(times(&schedule), vec![20]);
    }

    #[test]
    fn ingest_prunes_untouched_channels_too() {
        let mut schedule = CommandSchedule::new([CHANNEL, ChannelId::new(2)]);
        schedule.ingest(
            CommandBatch::from([(CHANNEL, vec![on(10), off(20)]), (ChannelId::new(2), vec![on(10), off(20)])]),
            at(0),
        );

        schedule.ingest(CommandBatch::from([(CHANNEL, vec![on(100)])]), at(50));

        assert_eq!(times(&schedule), vec![20, 100]);
        assert_eq!(schedule.commands(ChannelId::new(2)), &[off(20)]);
    }

    #[test]
    fn refresh_hint_is_none_when_all_channels_are_final() {
        let mut schedule = CommandSchedule::new([CHANNEL, ChannelId::new(2)]);
        schedule.ingest(
            CommandBatch::from([(CHANNEL, vec![on(10).last()]), (ChannelId::new(2), vec![off(20).last()])]),
            at(0),
        );

        assert_eq!(schedule.refresh_hint(at(0), t!(10 minutes)), None);
    }

    #[test]
    fn refresh_hint_leads_open_schedules() {
        let mut schedule = CommandSchedule::new([CHANNEL, ChannelId::new(2)]);
        let tail = at(3_600_000);
        schedule.ingest(
            CommandBatch::from([
                (CHANNEL, vec![on(10), OutletCommand::new(tail, OutletState::Off)]),
                (ChannelId::new(2), vec![off(20).last()]),
            ]),
            at(0),
        );

        assert_eq!(schedule.refresh_hint(at(0), t!(10 minutes)), Some(tail - t!(10 minutes)));
    }

    #[test]
    fn refresh_hint_is_now_for_channels_without_commands() {
        let schedule = schedule_with(vec![on(10).last()]);

        assert_eq!(schedule.refresh_hint(at(500), t!(10 minutes)), Some(at(500)));
    }

    fn command_strategy() -> impl Strategy<Value = OutletCommand> {
        (0i64..1_000, any::<bool>(), any::<bool>()).prop_map(|(time, is_on, is_last)| OutletCommand {
            time: at(time),
            state: if is_on { CommandedState::On } else { CommandedState::Off },
            is_last,
        })
    }

    proptest! {
        #[test]
        fn ingest_keeps_schedule_well_formed(
            batches in prop::collection::vec(prop::collection::vec(command_strategy(), 0..8), 1..6),
            now in 0i64..1_000,
        ) {
            let mut schedule = CommandSchedule::new([CHANNEL]);

            for batch in batches {
                schedule.ingest(CommandBatch::from([(CHANNEL, batch)]), at(now));

                let commands = schedule.commands(CHANNEL);
                prop_assert!(commands.windows(2).all(|pair| pair[0].time < pair[1].time));
                prop_assert!(commands.iter().rev().skip(1).all(|cmd| !cmd.is_last));
            }
        }

        #[test]
        fn prune_never_changes_present_or_future_state(
            commands in prop::collection::vec(command_strategy(), 0..12),
            now in 0i64..1_000,
            ahead in 0i64..500,
        ) {
            let unpruned = schedule_with(commands);
            let mut pruned = unpruned.clone();
            pruned.prune(at(now));

            for probe in [now, now + ahead] {
                prop_assert_eq!(
                    pruned.desired_state(CHANNEL, at(probe)),
                    unpruned.desired_state(CHANNEL, at(probe))
                );
            }
        }
    }
}
