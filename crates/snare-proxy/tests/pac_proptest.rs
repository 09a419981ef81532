use proptest::prelude::*;
use snare_proxy::pac::{self, PacMode};

fn host_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9](?:[a-z0-9.-]{0,20}[a-z0-9])?")
        .expect("valid hostname regex")
}

fn mode_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("PROXY"),
        Just("SOCKS"),
        Just("HTTP"),
        Just("HTTPS"),
        Just("SOCKS4"),
    ]
}

proptest! {
    #[test]
    fn directives_round_trip_through_display(
        mode in mode_strategy(),
        host in host_strategy(),
        port in 1_u16..=u16::MAX,
    ) {
        let input = format!("{mode} {host}:{port}");
        let directive = pac::first(&input).expect("canonical directive must parse");
        let reparsed = pac::first(&directive.to_string()).expect("display output must reparse");
        prop_assert_eq!(directive, reparsed);
    }

    #[test]
    fn directive_lists_preserve_order_and_length(
        mode in mode_strategy(),
        host in host_strategy(),
        port in 1_u16..=u16::MAX,
        count in 1_usize..5,
    ) {
        let directive = format!("{mode} {host}:{port}");
        let joined = std::iter::repeat(directive.as_str())
            .take(count)
            .collect::<Vec<_>>()
            .join(";");
        let parsed = pac::all(&joined).expect("list must parse");
        prop_assert_eq!(parsed.len(), count);
        for entry in &parsed {
            prop_assert_eq!(entry.host.as_str(), host.as_str());
            prop_assert_eq!(entry.port, port);
        }
    }

    #[test]
    fn unknown_modes_never_fail_they_go_direct(
        mode in "[A-Z]{3,8}",
        host in host_strategy(),
        port in 1_u16..=u16::MAX,
    ) {
        prop_assume!(!matches!(
            mode.as_str(),
            "DIRECT" | "PROXY" | "SOCKS" | "HTTP" | "HTTPS" | "SOCKS4"
        ));
        let directive = pac::first(&format!("{mode} {host}:{port}"))
            .expect("unknown directive types parse permissively");
        prop_assert_eq!(directive.mode, PacMode::Direct);
    }
}
