//! # Stage: Override Resolution
//!
//! Responsibility: compute the *effective* autotune and auto-advance
//! settings for one parameter from the global toggles and the parameter's
//! local override bundles.
//!
//! Guarantees:
//! - Pure and idempotent: same inputs, same output, no side effects.
//! - Priority order: force-global beats local override beats global default.
//!
//! NOT Responsible For:
//! - Mutating configuration (threshold edits happen in the coordinator).
//! - Deciding when thresholds fire (that is buffer logic, not resolution).
//!
//! Resolution is re-run every tick because both the globals and the local
//! bundles can change at runtime.

use crate::config::{GlobalToggles, OverrideBundle};

// ---------------------------------------------------------------------------
// EffectiveSettings
// ---------------------------------------------------------------------------

/// The resolved settings for one feature on one parameter. Derived, never
/// stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub enabled: bool,
    pub shot_threshold: u32,
}

/// Resolve one feature given its global default and the parameter's local
/// bundle.
fn resolve(
    force_global: bool,
    global_enabled: bool,
    global_threshold: u32,
    local: &OverrideBundle,
) -> EffectiveSettings {
    if !force_global && local.active {
        EffectiveSettings { enabled: local.enabled, shot_threshold: local.shot_threshold }
    } else {
        EffectiveSettings { enabled: global_enabled, shot_threshold: global_threshold }
    }
}

/// Effective autotune settings for a parameter.
pub fn resolve_autotune(global: &GlobalToggles, local: &OverrideBundle) -> EffectiveSettings {
    resolve(
        global.autotune_force_global,
        global.autotune_enabled,
        global.autotune_shot_threshold,
        local,
    )
}

/// Effective auto-advance settings for a parameter. Independent of autotune:
/// a parameter can auto-advance in manual mode and vice versa.
pub fn resolve_auto_advance(global: &GlobalToggles, local: &OverrideBundle) -> EffectiveSettings {
    resolve(
        global.auto_advance_force_global,
        global.auto_advance_enabled,
        global.auto_advance_shot_threshold,
        local,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn globals(enabled: bool, threshold: u32, force: bool) -> GlobalToggles {
        GlobalToggles {
            autotune_enabled: enabled,
            autotune_shot_threshold: threshold,
            autotune_force_global: force,
            auto_advance_enabled: enabled,
            auto_advance_shot_threshold: threshold,
            auto_advance_force_global: force,
            ..GlobalToggles::default()
        }
    }

    // ===== Priority order =====

    #[test]
    fn test_inactive_override_falls_back_to_global() {
        let g = globals(true, 10, false);
        let local = OverrideBundle { active: false, enabled: false, shot_threshold: 3 };
        let eff = resolve_autotune(&g, &local);
        assert!(eff.enabled);
        assert_eq!(eff.shot_threshold, 10);
    }

    #[test]
    fn test_active_override_wins_over_global() {
        let g = globals(true, 10, false);
        let local = OverrideBundle { active: true, enabled: false, shot_threshold: 3 };
        let eff = resolve_autotune(&g, &local);
        assert!(!eff.enabled);
        assert_eq!(eff.shot_threshold, 3);
    }

    #[test]
    fn test_force_global_ignores_active_override() {
        let g = globals(false, 10, true);
        let local = OverrideBundle { active: true, enabled: true, shot_threshold: 3 };
        let eff = resolve_autotune(&g, &local);
        assert!(!eff.enabled);
        assert_eq!(eff.shot_threshold, 10);
    }

    #[test]
    fn test_autotune_and_auto_advance_resolve_independently() {
        let g = GlobalToggles {
            autotune_enabled: true,
            autotune_shot_threshold: 10,
            auto_advance_enabled: false,
            auto_advance_shot_threshold: 6,
            ..GlobalToggles::default()
        };
        let autotune_local = OverrideBundle { active: true, enabled: false, shot_threshold: 4 };
        let advance_local = OverrideBundle::default();

        let at = resolve_autotune(&g, &autotune_local);
        let aa = resolve_auto_advance(&g, &advance_local);
        assert!(!at.enabled);
        assert_eq!(at.shot_threshold, 4);
        assert!(!aa.enabled);
        assert_eq!(aa.shot_threshold, 6);
    }

    // ===== Property: resolution matches the priority table =====

    proptest! {
        #[test]
        fn prop_resolution_priority(
            g_enabled: bool,
            g_threshold in 1u32..100,
            force: bool,
            l_active: bool,
            l_enabled: bool,
            l_threshold in 1u32..100,
        ) {
            let g = globals(g_enabled, g_threshold, force);
            let local = OverrideBundle {
                active: l_active,
                enabled: l_enabled,
                shot_threshold: l_threshold,
            };
            let eff = resolve_autotune(&g, &local);
            if force || !l_active {
                prop_assert_eq!(eff.enabled, g_enabled);
                prop_assert_eq!(eff.shot_threshold, g_threshold);
            } else {
                prop_assert_eq!(eff.enabled, l_enabled);
                prop_assert_eq!(eff.shot_threshold, l_threshold);
            }
        }

        #[test]
        fn prop_resolution_is_idempotent(
            g_enabled: bool,
            g_threshold in 1u32..100,
            force: bool,
            l_active: bool,
            l_enabled: bool,
            l_threshold in 1u32..100,
        ) {
            let g = globals(g_enabled, g_threshold, force);
            let local = OverrideBundle {
                active: l_active,
                enabled: l_enabled,
                shot_threshold: l_threshold,
            };
            prop_assert_eq!(resolve_autotune(&g, &local), resolve_autotune(&g, &local));
        }
    }
}
